use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Base of the marker closing the heredoc used by [`ComputeBackend::write_file`].
const HEREDOC_MARKER: &str = "RMEOF";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub bridge_name: String,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub network: String,
    pub env: Vec<(String, String)>,
    pub volumes: Vec<String>,
    pub privileged: bool,
    pub publish_all_ports: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    /// Attached network name to assigned IP address (may be empty).
    pub networks: BTreeMap<String, String>,
    /// Exposed port (e.g. `80/tcp`) to published host ports.
    pub ports: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkInfo, RuntimeError>;

    fn remove_network(&self, id: &str) -> Result<(), RuntimeError>;

    fn list_networks(&self) -> Result<Vec<NetworkInfo>, RuntimeError>;

    fn inspect_network(&self, id_or_name: &str) -> Result<NetworkInfo, RuntimeError>;

    fn connect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError>;

    fn disconnect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError>;

    /// Create and start a detached container.
    ///
    /// On failure the container may have been created but not started;
    /// callers clean up with [`find_container`](Self::find_container).
    fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerInfo, RuntimeError>;

    fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError>;

    fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError>;

    fn kill_container(&self, id: &str) -> Result<(), RuntimeError>;

    fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    fn exec(&self, container: &str, command: &[String]) -> Result<ExecOutput, RuntimeError>;

    /// Write `content` to `path` inside a running container.
    fn write_file(&self, container: &str, path: &str, content: &str) -> Result<(), RuntimeError> {
        let script = heredoc_script(path, content);
        let command = vec!["/bin/sh".to_owned(), "-c".to_owned(), script];
        let output = self.exec(container, &command)?;
        if output.success() {
            Ok(())
        } else {
            Err(RuntimeError::CommandFailed {
                command: format!("write {path}"),
                code: output.exit_code,
                stderr: output.stderr.trim().to_owned(),
            })
        }
    }

    /// Read a file from inside a running container.
    fn read_file(&self, container: &str, path: &str) -> Result<String, RuntimeError> {
        let command = vec!["cat".to_owned(), path.to_owned()];
        let output = self.exec(container, &command)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(RuntimeError::CommandFailed {
                command: format!("cat {path}"),
                code: output.exit_code,
                stderr: output.stderr.trim().to_owned(),
            })
        }
    }
}

/// Shell script writing `content` to `path`. The heredoc marker never
/// matches a line of `content`.
pub fn heredoc_script(path: &str, content: &str) -> String {
    let mut marker = HEREDOC_MARKER.to_owned();
    let mut n = 0u32;
    while content.lines().any(|line| line == marker) {
        n += 1;
        marker = format!("{HEREDOC_MARKER}_{n}");
    }
    format!("cat > {path} <<'{marker}'\n{content}\n{marker}\n")
}

pub fn select_backend(name: &str) -> Result<Box<dyn ComputeBackend>, RuntimeError> {
    match name {
        "docker" => Ok(Box::new(crate::docker::DockerBackend::new())),
        "mock" => Ok(Box::new(crate::mock::MockBackend::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
