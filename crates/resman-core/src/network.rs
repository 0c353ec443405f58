//! Network-backed resource instances.

use crate::instance::{BackendBinding, ExecutionContext, ExecutionOutcome, ResourceInstance};
use crate::CoreError;
use resman_runtime::NetworkSpec;
use resman_schema::StandardTransition;
use serde_json::Value;
use tracing::{info, warn};

/// Name of the bridge device backing a managed network.
pub fn bridge_name(instance: &ResourceInstance) -> String {
    format!("net{}", instance.resource_id)
}

pub(crate) fn run_standard(
    instance: &mut ResourceInstance,
    ctx: ExecutionContext<'_>,
    transition: StandardTransition,
) -> Result<ExecutionOutcome, CoreError> {
    match transition {
        StandardTransition::Install => install(instance, ctx),
        StandardTransition::Uninstall => Ok(uninstall(instance, ctx)),
        other => Ok(ExecutionOutcome::NoResult(format!(
            "{other} is not supported by network resources"
        ))),
    }
}

pub(crate) fn run_operation(instance: &ResourceInstance, name: &str) -> ExecutionOutcome {
    ExecutionOutcome::NoResult(format!(
        "operation {name} is not supported by network {}",
        instance.name
    ))
}

fn install(instance: &mut ResourceInstance, ctx: ExecutionContext<'_>) -> Result<ExecutionOutcome, CoreError> {
    let name = instance
        .property_str("networkname")
        .ok_or_else(|| CoreError::MissingProperty("networkname".to_owned()))?;
    let bridge = bridge_name(instance);
    let spec = NetworkSpec {
        name: name.clone(),
        bridge_name: bridge.clone(),
        subnet: instance.property_str("subnet"),
        gateway: instance.property_str("gateway"),
    };

    let created = ctx.backend.create_network(&spec)?;
    info!("created network {name} ({}) on bridge {bridge}", created.id);
    instance
        .properties
        .insert("bridgename".to_owned(), Value::String(bridge));
    instance
        .properties
        .insert("networkid".to_owned(), Value::String(created.id.clone()));
    instance.binding = Some(BackendBinding::Network {
        id: created.id,
        name: created.name,
    });
    Ok(ExecutionOutcome::Completed)
}

/// Remove a managed network. Discovered networks are left untouched.
fn uninstall(instance: &ResourceInstance, ctx: ExecutionContext<'_>) -> ExecutionOutcome {
    if instance.readonly {
        info!("network {} is read-only, leaving it in place", instance.name);
        return ExecutionOutcome::Completed;
    }
    let id = match &instance.binding {
        Some(binding) => Some(binding.id().to_owned()),
        None => instance.property_str("networkid"),
    };
    let Some(id) = id else {
        return ExecutionOutcome::Failed(format!("network {} was never created", instance.name));
    };
    match ctx.backend.remove_network(&id) {
        Ok(()) => {
            info!("removed network {} ({id})", instance.name);
            ExecutionOutcome::Removed
        }
        Err(e) => {
            warn!("failed to remove network {}: {e}", instance.name);
            ExecutionOutcome::Failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resman_runtime::{ComputeBackend, MockBackend};
    use resman_schema::{Properties, ResourceId, ResourceType};
    use serde_json::json;
    use std::sync::Arc;

    fn instance(name: &str) -> ResourceInstance {
        let mut props = Properties::new();
        props.insert("networkname".to_owned(), json!(name));
        props.insert("subnet".to_owned(), json!("10.10.0.0/24"));
        ResourceInstance::new(
            ResourceId::new(7),
            Arc::new(ResourceType::builtin_network().unwrap()),
            name,
            "local",
            props,
        )
    }

    fn ctx(backend: &MockBackend) -> ExecutionContext<'_> {
        ExecutionContext {
            backend,
            publish_all_ports: false,
        }
    }

    #[test]
    fn install_creates_bridge_network() {
        let backend = MockBackend::new();
        let mut inst = instance("net1");
        let outcome = run_standard(&mut inst, ctx(&backend), StandardTransition::Install).unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert_eq!(inst.property_str("bridgename").as_deref(), Some("net7"));

        let id = inst.property_str("networkid").unwrap();
        let info = backend.inspect_network(&id).unwrap();
        assert_eq!(info.name, "net1");
        assert_eq!(info.subnet.as_deref(), Some("10.10.0.0/24"));
        assert_eq!(info.gateway, None);
    }

    #[test]
    fn uninstall_removes_managed_network() {
        let backend = MockBackend::new();
        let mut inst = instance("net1");
        run_standard(&mut inst, ctx(&backend), StandardTransition::Install).unwrap();
        let outcome = run_standard(&mut inst, ctx(&backend), StandardTransition::Uninstall).unwrap();
        assert_eq!(outcome, ExecutionOutcome::Removed);
        assert!(!backend.network_names().contains(&"net1".to_owned()));
    }

    #[test]
    fn uninstall_leaves_readonly_network() {
        let backend = MockBackend::new();
        let info = backend.inspect_network("bridge").unwrap();
        let mut inst = ResourceInstance::discovered_network(
            ResourceId::new(1),
            Arc::new(ResourceType::builtin_network().unwrap()),
            "local",
            &info,
        );
        let outcome = run_standard(&mut inst, ctx(&backend), StandardTransition::Uninstall).unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert!(backend.network_names().contains(&"bridge".to_owned()));
    }

    #[test]
    fn failed_removal_is_a_failed_outcome() {
        let backend = MockBackend::new();
        let mut inst = instance("net1");
        run_standard(&mut inst, ctx(&backend), StandardTransition::Install).unwrap();
        backend.fail_next_remove();
        let outcome = run_standard(&mut inst, ctx(&backend), StandardTransition::Uninstall).unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Failed(_)));
    }

    #[test]
    fn other_transitions_have_no_result() {
        let backend = MockBackend::new();
        let mut inst = instance("net1");
        let outcome = run_standard(&mut inst, ctx(&backend), StandardTransition::Start).unwrap();
        assert!(matches!(outcome, ExecutionOutcome::NoResult(_)));
        assert!(matches!(run_operation(&inst, "reload"), ExecutionOutcome::NoResult(_)));
    }
}
