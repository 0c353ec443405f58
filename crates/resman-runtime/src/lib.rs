//! Compute backends for resman.
//!
//! The `ComputeBackend` trait is the contract the resource instances drive:
//! network create/remove/connect, container run/inspect/kill/remove, and
//! command execution inside a running container. `DockerBackend` talks to
//! the `docker` CLI; `MockBackend` keeps everything in memory for tests and
//! dry runs.

pub mod backend;
pub mod docker;
pub mod mock;

pub use backend::{
    select_backend, ComputeBackend, ContainerInfo, ContainerSpec, ExecOutput, NetworkInfo,
    NetworkSpec,
};
pub use docker::DockerBackend;
pub use mock::{ExecHook, MockBackend};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("network not found: {0}")]
    NetworkNotFound(String),
    #[error("'{command}' failed with exit code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_display() {
        let e = RuntimeError::CommandFailed {
            command: "docker run".to_owned(),
            code: 125,
            stderr: "no such image".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("docker run"));
        assert!(msg.contains("125"));
        assert!(msg.contains("no such image"));
    }

    #[test]
    fn not_found_display() {
        assert!(RuntimeError::ContainerNotFound("web1".to_owned())
            .to_string()
            .contains("web1"));
        assert!(RuntimeError::NetworkNotFound("n1".to_owned())
            .to_string()
            .contains("n1"));
    }
}
