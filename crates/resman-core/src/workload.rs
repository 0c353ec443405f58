//! Container-backed resource instances.
//!
//! A workload runs as one privileged container named after its image and
//! resource id. Lifecycle and operation commands execute inside it; their
//! input properties are written to a YAML params file first, and the
//! lifecycle params file is read back afterwards so a command can update
//! the values of properties that already exist.

use crate::instance::{BackendBinding, ExecutionContext, ExecutionOutcome, ResourceInstance};
use crate::CoreError;
use resman_runtime::{ContainerSpec, RuntimeError};
use resman_schema::{display_value, Properties, StandardTransition};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Params file for lifecycle commands; also read back after every command.
pub const LIFECYCLE_PARAMS: &str = "/etc/rmparams";
/// Params file for operation commands.
pub const OPERATION_PARAMS: &str = "/etc/opparams";

const CGROUP_VOLUME: &str = "/sys/fs/cgroup:/sys/fs/cgroup:ro";
const ENV_PREFIX: &str = "RM_PROP_";
const NETWORK_PROPERTY: &str = "docker_network";
const HOSTNAME_PROPERTY: &str = "docker_hostname";
const IPADDR_PROPERTY: &str = "docker_ipaddr";
const PORT_MAPPING_PREFIX: &str = "port_mapping_";
const DEFAULT_NETWORK: &str = "bridge";
const HOST_NETWORK: &str = "host";
const HOST_ADDRESS: &str = "HOSTIP";

pub fn container_name(instance: &ResourceInstance) -> String {
    format!("{}{}", instance.resource_type.image_name, instance.resource_id)
}

pub(crate) fn run_standard(
    instance: &mut ResourceInstance,
    ctx: ExecutionContext<'_>,
    transition: StandardTransition,
) -> Result<ExecutionOutcome, CoreError> {
    match transition {
        StandardTransition::Install => install(instance, ctx),
        StandardTransition::Uninstall => Ok(uninstall(instance, ctx)),
        other => run_lifecycle_command(instance, ctx, other),
    }
}

pub(crate) fn run_operation(
    instance: &mut ResourceInstance,
    ctx: ExecutionContext<'_>,
    name: &str,
    properties: &Properties,
) -> Result<ExecutionOutcome, CoreError> {
    match name {
        "addNetwork" => {
            let (network, container) = network_operation_target(instance, properties)?;
            ctx.backend.connect_network(&network, &container)?;
            info!("connected {} to network {network}", instance.name);
            Ok(ExecutionOutcome::Completed)
        }
        "removeNetwork" => {
            let (network, container) = network_operation_target(instance, properties)?;
            ctx.backend.disconnect_network(&network, &container)?;
            info!("disconnected {} from network {network}", instance.name);
            Ok(ExecutionOutcome::Completed)
        }
        other => match instance.resource_type.operation_command(other) {
            Some(command) => {
                let command = command.to_owned();
                run_command(instance, ctx, &command, Some(properties), OPERATION_PARAMS)
            }
            None => Ok(ExecutionOutcome::NoResult(format!(
                "no operation configuration for {other} on {}",
                instance.type_name()
            ))),
        },
    }
}

fn network_operation_target(
    instance: &ResourceInstance,
    properties: &Properties,
) -> Result<(String, String), CoreError> {
    let network = properties
        .get("networkid")
        .map(display_value)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::MissingProperty("networkid".to_owned()))?;
    let container = bound_container(instance)
        .ok_or_else(|| CoreError::NoContainerFound(instance.resource_id.to_string()))?;
    Ok((network, container))
}

fn bound_container(instance: &ResourceInstance) -> Option<String> {
    match &instance.binding {
        Some(BackendBinding::Container { id, .. }) => Some(id.clone()),
        _ => None,
    }
}

/// The container id for `instance`, looking it up by name when unbound.
fn resolve_container(
    instance: &mut ResourceInstance,
    ctx: ExecutionContext<'_>,
) -> Result<String, CoreError> {
    if let Some(id) = bound_container(instance) {
        return Ok(id);
    }
    let name = container_name(instance);
    let info = ctx
        .backend
        .find_container(&name)?
        .ok_or_else(|| CoreError::NoContainerFound(instance.resource_id.to_string()))?;
    instance.binding = Some(BackendBinding::Container {
        id: info.id.clone(),
        name: info.name,
    });
    Ok(info.id)
}

/// Launch the container and run the install command. A container launched
/// by an install that does not complete is removed again.
fn install(instance: &mut ResourceInstance, ctx: ExecutionContext<'_>) -> Result<ExecutionOutcome, CoreError> {
    let result = start_container(instance, ctx)
        .and_then(|()| run_lifecycle_command(instance, ctx, StandardTransition::Install));
    if matches!(result, Err(_) | Ok(ExecutionOutcome::Failed(_))) {
        discard_container(instance, ctx);
    }
    result
}

fn discard_container(instance: &mut ResourceInstance, ctx: ExecutionContext<'_>) {
    let Some(id) = bound_container(instance) else {
        return;
    };
    warn!("install of {} failed, removing its container", instance.name);
    if let Err(e) = ctx.backend.kill_container(&id) {
        debug!("could not kill container of {}: {e}", instance.name);
    }
    match ctx.backend.remove_container(&id, true) {
        Ok(()) => instance.binding = None,
        Err(e) => warn!("failed to remove container of {}: {e}", instance.name),
    }
}

fn start_container(instance: &mut ResourceInstance, ctx: ExecutionContext<'_>) -> Result<(), CoreError> {
    let image = instance.resource_type.image_name.clone();
    if !ctx.backend.image_exists(&image)? {
        return Err(CoreError::NoImageFound(image));
    }

    let name = container_name(instance);
    let network = instance
        .property_str(NETWORK_PROPERTY)
        .unwrap_or_else(|| DEFAULT_NETWORK.to_owned());
    let hostname = instance
        .property_str(HOSTNAME_PROPERTY)
        .or_else(|| Some(instance.name.clone()).filter(|n| !n.is_empty()));
    let env = instance
        .properties
        .iter()
        .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), display_value(v)))
        .collect();

    let spec = ContainerSpec {
        name: name.clone(),
        image,
        hostname,
        network: network.clone(),
        env,
        volumes: vec![CGROUP_VOLUME.to_owned()],
        privileged: true,
        publish_all_ports: ctx.publish_all_ports,
    };

    info!("starting container {name} on network {network}");
    let started = match ctx.backend.run_container(&spec) {
        Ok(info) => info,
        Err(e) => {
            remove_partial_container(ctx, &name);
            return Err(e.into());
        }
    };
    instance.binding = Some(BackendBinding::Container {
        id: started.id.clone(),
        name: started.name.clone(),
    });

    let container = ctx.backend.inspect_container(&started.id)?;
    let address = if network == HOST_NETWORK {
        HOST_ADDRESS.to_owned()
    } else {
        container.networks.get(&network).cloned().unwrap_or_default()
    };
    instance
        .properties
        .insert(IPADDR_PROPERTY.to_owned(), Value::String(address));
    for (port, host_ports) in &container.ports {
        if let Some(first) = host_ports.first() {
            instance.properties.insert(
                format!("{PORT_MAPPING_PREFIX}{port}"),
                Value::String(first.clone()),
            );
        }
    }

    connect_extra_networks(instance, ctx, &started.id);
    Ok(())
}

fn remove_partial_container(ctx: ExecutionContext<'_>, name: &str) {
    match ctx.backend.find_container(name) {
        Ok(Some(partial)) => {
            warn!("removing partially created container {name}");
            if let Err(e) = ctx.backend.remove_container(&partial.id, true) {
                warn!("failed to remove container {name}: {e}");
            }
        }
        Ok(None) => {}
        Err(e) => warn!("failed to look up container {name}: {e}"),
    }
}

/// Attach the container to every `docker_network<suffix>` network, filling
/// `docker_ipaddr<suffix>` where the workload declares it.
fn connect_extra_networks(instance: &mut ResourceInstance, ctx: ExecutionContext<'_>, container: &str) {
    let extra: Vec<(String, String)> = instance
        .properties
        .iter()
        .filter_map(|(key, value)| {
            let suffix = key.strip_prefix(NETWORK_PROPERTY)?;
            let network = display_value(value);
            (!suffix.is_empty() && !network.is_empty()).then(|| (suffix.to_owned(), network))
        })
        .collect();

    for (suffix, network) in extra {
        let attached = ctx
            .backend
            .inspect_network(&network)
            .and_then(|net| ctx.backend.connect_network(&net.id, container).map(|()| net));
        let net = match attached {
            Ok(net) => net,
            Err(e) => {
                warn!("could not attach {} to network {network}: {e}", instance.name);
                continue;
            }
        };
        debug!("attached {} to network {network}", instance.name);

        let key = format!("{IPADDR_PROPERTY}{suffix}");
        if !instance.properties.contains_key(&key) {
            continue;
        }
        match ctx.backend.inspect_container(container) {
            Ok(info) => {
                let address = info.networks.get(&net.name).cloned().unwrap_or_default();
                instance.properties.insert(key, Value::String(address));
            }
            Err(e) => warn!("could not read address of {} on {network}: {e}", instance.name),
        }
    }
}

fn run_lifecycle_command(
    instance: &mut ResourceInstance,
    ctx: ExecutionContext<'_>,
    transition: StandardTransition,
) -> Result<ExecutionOutcome, CoreError> {
    if !instance.resource_type.has_lifecycle_commands() {
        return Ok(ExecutionOutcome::NoResult(format!(
            "no lifecycle configuration for {}",
            instance.type_name()
        )));
    }
    match instance.resource_type.lifecycle_command(transition) {
        Some(command) => {
            let command = command.to_owned();
            run_command(instance, ctx, &command, None, LIFECYCLE_PARAMS)
        }
        None => {
            debug!("no {transition} command for {}", instance.type_name());
            Ok(ExecutionOutcome::Completed)
        }
    }
}

/// Send properties, execute `command` in the container, then merge back.
fn run_command(
    instance: &mut ResourceInstance,
    ctx: ExecutionContext<'_>,
    command: &str,
    params: Option<&Properties>,
    params_file: &str,
) -> Result<ExecutionOutcome, CoreError> {
    let container = resolve_container(instance, ctx)?;

    let yaml = serde_yaml::to_string(params.unwrap_or(&instance.properties))?;
    ctx.backend.write_file(&container, params_file, &yaml)?;

    let argv: Vec<String> = command.split_whitespace().map(str::to_owned).collect();
    info!("running {command} in {}", instance.name);
    let output = ctx.backend.exec(&container, &argv)?;
    for line in output.stdout.lines().chain(output.stderr.lines()) {
        info!("{}: {line}", instance.name);
    }
    if !output.success() {
        return Err(RuntimeError::CommandFailed {
            command: command.to_owned(),
            code: output.exit_code,
            stderr: output.stderr.trim().to_owned(),
        }
        .into());
    }

    merge_back(instance, ctx, &container);
    Ok(ExecutionOutcome::Completed)
}

/// Copy values for already-known keys from the lifecycle params file.
fn merge_back(instance: &mut ResourceInstance, ctx: ExecutionContext<'_>, container: &str) {
    let text = match ctx.backend.read_file(container, LIFECYCLE_PARAMS) {
        Ok(text) => text,
        Err(e) => {
            warn!("could not read {LIFECYCLE_PARAMS} from {}: {e}", instance.name);
            return;
        }
    };
    if text.trim().is_empty() {
        return;
    }
    let returned: Properties = match serde_yaml::from_str(&text) {
        Ok(props) => props,
        Err(e) => {
            warn!("ignoring malformed {LIFECYCLE_PARAMS} from {}: {e}", instance.name);
            return;
        }
    };
    for (key, value) in returned {
        match instance.properties.get_mut(&key) {
            Some(existing) => *existing = value,
            None => debug!("ignoring new property {key} returned by {}", instance.name),
        }
    }
}

/// Run the uninstall command, then force-remove the container. Failures end
/// in a failed outcome rather than an error.
fn uninstall(instance: &mut ResourceInstance, ctx: ExecutionContext<'_>) -> ExecutionOutcome {
    if let Some(command) = instance
        .resource_type
        .lifecycle_command(StandardTransition::Uninstall)
        .map(str::to_owned)
    {
        if let Err(e) = run_command(instance, ctx, &command, None, LIFECYCLE_PARAMS) {
            return ExecutionOutcome::Failed(e.to_string());
        }
    }

    let container = match resolve_container(instance, ctx) {
        Ok(id) => id,
        Err(e) => return ExecutionOutcome::Failed(e.to_string()),
    };
    if let Err(e) = ctx.backend.kill_container(&container) {
        warn!("could not kill container of {}: {e}", instance.name);
    }
    if let Err(e) = ctx.backend.remove_container(&container, true) {
        return ExecutionOutcome::Failed(e.to_string());
    }
    info!("removed container of {}", instance.name);
    ExecutionOutcome::Removed
}
