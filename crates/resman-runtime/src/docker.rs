use crate::backend::{ComputeBackend, ContainerInfo, ContainerSpec, ExecOutput, NetworkInfo, NetworkSpec};
use crate::RuntimeError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::{Command, Output};
use tracing::debug;

const BRIDGE_NAME_OPTION: &str = "com.docker.network.bridge.name";

/// Drives the `docker` CLI.
pub struct DockerBackend {
    binary: String,
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self {
            binary: "docker".to_owned(),
        }
    }
}

impl DockerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn output(&self, args: &[String]) -> Result<Output, RuntimeError> {
        debug!("{} {}", self.binary, args.join(" "));
        Ok(Command::new(&self.binary).args(args).output()?)
    }

    /// Run a docker subcommand and return its trimmed stdout, failing on a
    /// non-zero exit.
    fn run(&self, args: &[String]) -> Result<String, RuntimeError> {
        let output = self.output(args)?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: format!("{} {}", self.binary, args.first().map_or("", String::as_str)),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    fn inspect_json(&self, args: &[String]) -> Result<Vec<Value>, RuntimeError> {
        let stdout = self.run(args)?;
        serde_json::from_str(&stdout)
            .map_err(|e| RuntimeError::ExecFailed(format!("failed to parse docker inspect output: {e}")))
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

fn is_not_found(err: &RuntimeError) -> bool {
    match err {
        RuntimeError::CommandFailed { stderr, .. } => {
            let msg = stderr.to_lowercase();
            msg.contains("no such") || msg.contains("not found")
        }
        _ => false,
    }
}

/// Extract network identity and its first IPAM pool from `docker network inspect` JSON.
pub fn parse_network(value: &Value) -> Result<NetworkInfo, RuntimeError> {
    let id = value
        .get("Id")
        .and_then(Value::as_str)
        .ok_or_else(|| RuntimeError::ExecFailed("network inspect output has no Id".to_owned()))?;
    let pool = value
        .pointer("/IPAM/Config/0")
        .filter(|v| v.is_object());
    let field = |key: &str| {
        pool.and_then(|p| p.get(key))
            .and_then(Value::as_str)
            .map(str::to_owned)
    };
    Ok(NetworkInfo {
        id: id.to_owned(),
        name: value
            .get("Name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        driver: value
            .get("Driver")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        subnet: field("Subnet"),
        gateway: field("Gateway"),
    })
}

/// Extract identity, network addresses and published ports from
/// `docker inspect --type container` JSON.
pub fn parse_container(value: &Value) -> Result<ContainerInfo, RuntimeError> {
    let id = value
        .get("Id")
        .and_then(Value::as_str)
        .ok_or_else(|| RuntimeError::ExecFailed("container inspect output has no Id".to_owned()))?;

    let networks = value
        .pointer("/NetworkSettings/Networks")
        .and_then(Value::as_object)
        .map(|nets| {
            nets.iter()
                .map(|(name, net)| {
                    let ip = net
                        .get("IPAddress")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    (name.clone(), ip.to_owned())
                })
                .collect()
        })
        .unwrap_or_default();

    let mut ports = BTreeMap::new();
    if let Some(map) = value
        .pointer("/NetworkSettings/Ports")
        .and_then(Value::as_object)
    {
        for (port, bindings) in map {
            let host_ports: Vec<String> = bindings
                .as_array()
                .map(|list| {
                    list.iter()
                        .filter_map(|b| b.get("HostPort").and_then(Value::as_str))
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default();
            ports.insert(port.clone(), host_ports);
        }
    }

    Ok(ContainerInfo {
        id: id.to_owned(),
        name: value
            .get("Name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_owned(),
        running: value
            .pointer("/State/Running")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        networks,
        ports,
    })
}

/// `docker run` arguments for a detached container.
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut out = args(["run", "--detach", "--name"]);
    out.push(spec.name.clone());
    if let Some(hostname) = &spec.hostname {
        out.push("--hostname".to_owned());
        out.push(hostname.clone());
    }
    out.push("--network".to_owned());
    out.push(spec.network.clone());
    for volume in &spec.volumes {
        out.push("--volume".to_owned());
        out.push(volume.clone());
    }
    if spec.privileged {
        out.push("--privileged".to_owned());
    }
    if spec.publish_all_ports {
        out.push("--publish-all".to_owned());
    }
    for (key, value) in &spec.env {
        out.push("--env".to_owned());
        out.push(format!("{key}={value}"));
    }
    out.push(spec.image.clone());
    out
}

impl ComputeBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn available(&self) -> bool {
        self.output(&args(["version", "--format", "{{.Server.Version}}"]))
            .is_ok_and(|o| o.status.success())
    }

    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let output = self.output(&args(["image", "inspect", "--format", "{{.Id}}", image]))?;
        Ok(output.status.success())
    }

    fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkInfo, RuntimeError> {
        let mut cmd = args(["network", "create", "--driver", "bridge", "--opt"]);
        cmd.push(format!("{BRIDGE_NAME_OPTION}={}", spec.bridge_name));
        if let Some(subnet) = spec.subnet.as_deref().filter(|s| !s.is_empty()) {
            cmd.push("--subnet".to_owned());
            cmd.push(subnet.to_owned());
        }
        if let Some(gateway) = spec.gateway.as_deref().filter(|s| !s.is_empty()) {
            cmd.push("--gateway".to_owned());
            cmd.push(gateway.to_owned());
        }
        cmd.push(spec.name.clone());
        let id = self.run(&cmd)?;
        self.inspect_network(&id)
    }

    fn remove_network(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&args(["network", "rm", id])).map(|_| ())
    }

    fn list_networks(&self) -> Result<Vec<NetworkInfo>, RuntimeError> {
        let ids = self.run(&args(["network", "ls", "--quiet", "--no-trunc"]))?;
        let ids: Vec<String> = ids.lines().map(str::to_owned).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = args(["network", "inspect"]);
        cmd.extend(ids);
        self.inspect_json(&cmd)?.iter().map(parse_network).collect()
    }

    fn inspect_network(&self, id_or_name: &str) -> Result<NetworkInfo, RuntimeError> {
        let values = self
            .inspect_json(&args(["network", "inspect", id_or_name]))
            .map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::NetworkNotFound(id_or_name.to_owned())
                } else {
                    e
                }
            })?;
        values
            .first()
            .ok_or_else(|| RuntimeError::NetworkNotFound(id_or_name.to_owned()))
            .and_then(parse_network)
    }

    fn connect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError> {
        self.run(&args(["network", "connect", network, container]))
            .map(|_| ())
    }

    fn disconnect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError> {
        self.run(&args(["network", "disconnect", network, container]))
            .map(|_| ())
    }

    fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerInfo, RuntimeError> {
        let id = self.run(&run_args(spec))?;
        self.inspect_container(&id)
    }

    fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        let filter = format!("name=^/{name}$");
        let ids = self.run(&args(["ps", "--all", "--quiet", "--no-trunc", "--filter", &filter]))?;
        match ids.lines().next() {
            Some(id) => self.inspect_container(id).map(Some),
            None => Ok(None),
        }
    }

    fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let values = self
            .inspect_json(&args(["inspect", "--type", "container", id]))
            .map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::ContainerNotFound(id.to_owned())
                } else {
                    e
                }
            })?;
        values
            .first()
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_owned()))
            .and_then(parse_container)
    }

    fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&args(["kill", id])).map(|_| ())
    }

    fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let cmd = if force {
            args(["rm", "--force", id])
        } else {
            args(["rm", id])
        };
        self.run(&cmd).map(|_| ())
    }

    fn exec(&self, container: &str, command: &[String]) -> Result<ExecOutput, RuntimeError> {
        let mut cmd = args(["exec", container]);
        cmd.extend(command.iter().cloned());
        let output = self.output(&cmd)?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
