use crate::backend::{ComputeBackend, ContainerInfo, ContainerSpec, ExecOutput, NetworkInfo, NetworkSpec};
use crate::RuntimeError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Callback run on every `exec`, with the container name, the command and
/// the container's in-memory files.
pub type ExecHook = Arc<dyn Fn(&str, &[String], &mut BTreeMap<String, String>) + Send + Sync>;

#[derive(Debug, Clone)]
struct MockContainer {
    info: ContainerInfo,
    spec: ContainerSpec,
    files: BTreeMap<String, String>,
}

#[derive(Default)]
struct MockState {
    networks: BTreeMap<String, NetworkInfo>,
    containers: BTreeMap<String, MockContainer>,
    missing_images: BTreeSet<String>,
    next_id: u64,
    fail_next_run: Option<bool>,
    fail_next_exec: bool,
    fail_next_remove: bool,
    exec_log: Vec<(String, Vec<String>)>,
    networks_created: usize,
}

impl MockState {
    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:012x}", self.next_id)
    }

    fn network_key(&self, id_or_name: &str) -> Option<String> {
        self.networks
            .values()
            .find(|n| n.id == id_or_name || n.name == id_or_name)
            .map(|n| n.id.clone())
    }

    fn container_key(&self, id_or_name: &str) -> Option<String> {
        self.containers
            .values()
            .find(|c| c.info.id == id_or_name || c.info.name == id_or_name)
            .map(|c| c.info.id.clone())
    }

    fn container_mut(&mut self, id_or_name: &str) -> Result<&mut MockContainer, RuntimeError> {
        let key = self
            .container_key(id_or_name)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id_or_name.to_owned()))?;
        self.containers
            .get_mut(&key)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id_or_name.to_owned()))
    }

    fn address_for(&mut self, network: &str) -> String {
        self.next_id += 1;
        if network == "host" {
            String::new()
        } else {
            format!("172.18.{}.{}", (self.next_id / 250) % 250, self.next_id % 250 + 2)
        }
    }
}

/// In-memory backend. Keeps networks, containers and their files, and
/// supports failure injection for tests.
pub struct MockBackend {
    state: Mutex<MockState>,
    hooks: Mutex<Vec<ExecHook>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        let mut state = MockState::default();
        for name in ["bridge", "host", "none"] {
            let id = state.allocate_id("net");
            state.networks.insert(
                id.clone(),
                NetworkInfo {
                    id,
                    name: name.to_owned(),
                    driver: name.to_owned(),
                    subnet: None,
                    gateway: None,
                },
            );
        }
        Self {
            state: Mutex::new(state),
            hooks: Mutex::new(Vec::new()),
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend with no pre-existing networks.
    pub fn empty() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            hooks: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))
    }

    /// Make `image_exists` report `image` as absent.
    pub fn mark_image_missing(&self, image: &str) {
        if let Ok(mut state) = self.lock() {
            state.missing_images.insert(image.to_owned());
        }
    }

    /// Fail the next `run_container`. With `partial`, the container is left
    /// behind in a created-but-stopped state, as a daemon does when start fails.
    pub fn fail_next_run(&self, partial: bool) {
        if let Ok(mut state) = self.lock() {
            state.fail_next_run = Some(partial);
        }
    }

    /// Make the next `exec` exit with a non-zero code.
    pub fn fail_next_exec(&self) {
        if let Ok(mut state) = self.lock() {
            state.fail_next_exec = true;
        }
    }

    /// Make the next container or network removal fail.
    pub fn fail_next_remove(&self) {
        if let Ok(mut state) = self.lock() {
            state.fail_next_remove = true;
        }
    }

    pub fn add_exec_hook<F>(&self, hook: F)
    where
        F: Fn(&str, &[String], &mut BTreeMap<String, String>) + Send + Sync + 'static,
    {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push(Arc::new(hook));
        }
    }

    /// Register a network as if it had been created outside the manager.
    pub fn add_external_network(&self, name: &str, subnet: Option<&str>, gateway: Option<&str>) -> String {
        let Ok(mut state) = self.lock() else {
            return String::new();
        };
        let id = state.allocate_id("net");
        state.networks.insert(
            id.clone(),
            NetworkInfo {
                id: id.clone(),
                name: name.to_owned(),
                driver: "bridge".to_owned(),
                subnet: subnet.map(str::to_owned),
                gateway: gateway.map(str::to_owned),
            },
        );
        id
    }

    pub fn executed_commands(&self) -> Vec<(String, Vec<String>)> {
        self.lock().map(|s| s.exec_log.clone()).unwrap_or_default()
    }

    pub fn network_names(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.networks.values().map(|n| n.name.clone()).collect())
            .unwrap_or_default()
    }

    /// How many networks were created through `create_network`.
    pub fn networks_created(&self) -> usize {
        self.lock().map(|s| s.networks_created).unwrap_or_default()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.containers.values().map(|c| c.info.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn container_spec(&self, name: &str) -> Option<ContainerSpec> {
        let state = self.lock().ok()?;
        let key = state.container_key(name)?;
        state.containers.get(&key).map(|c| c.spec.clone())
    }

    pub fn file(&self, container: &str, path: &str) -> Option<String> {
        let state = self.lock().ok()?;
        let key = state.container_key(container)?;
        state.containers.get(&key)?.files.get(path).cloned()
    }

    /// Publish `port` of a running container on `host_port`.
    pub fn publish_port(&self, container: &str, port: &str, host_port: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        let c = state.container_mut(container)?;
        c.info
            .ports
            .entry(port.to_owned())
            .or_default()
            .push(host_port.to_owned());
        Ok(())
    }
}

impl ComputeBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(!self.lock()?.missing_images.contains(image))
    }

    fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkInfo, RuntimeError> {
        let mut state = self.lock()?;
        if state.network_key(&spec.name).is_some() {
            return Err(RuntimeError::CommandFailed {
                command: "network create".to_owned(),
                code: 1,
                stderr: format!("network with name {} already exists", spec.name),
            });
        }
        let id = state.allocate_id("net");
        let info = NetworkInfo {
            id: id.clone(),
            name: spec.name.clone(),
            driver: "bridge".to_owned(),
            subnet: spec.subnet.clone().filter(|s| !s.is_empty()),
            gateway: spec.gateway.clone().filter(|s| !s.is_empty()),
        };
        state.networks.insert(id, info.clone());
        state.networks_created += 1;
        Ok(info)
    }

    fn remove_network(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        if std::mem::take(&mut state.fail_next_remove) {
            return Err(RuntimeError::ExecFailed(format!("injected failure removing network {id}")));
        }
        let key = state
            .network_key(id)
            .ok_or_else(|| RuntimeError::NetworkNotFound(id.to_owned()))?;
        state.networks.remove(&key);
        Ok(())
    }

    fn list_networks(&self) -> Result<Vec<NetworkInfo>, RuntimeError> {
        Ok(self.lock()?.networks.values().cloned().collect())
    }

    fn inspect_network(&self, id_or_name: &str) -> Result<NetworkInfo, RuntimeError> {
        let state = self.lock()?;
        state
            .network_key(id_or_name)
            .and_then(|k| state.networks.get(&k).cloned())
            .ok_or_else(|| RuntimeError::NetworkNotFound(id_or_name.to_owned()))
    }

    fn connect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        let net_name = state
            .network_key(network)
            .and_then(|k| state.networks.get(&k).map(|n| n.name.clone()))
            .ok_or_else(|| RuntimeError::NetworkNotFound(network.to_owned()))?;
        let address = state.address_for(&net_name);
        let c = state.container_mut(container)?;
        c.info.networks.insert(net_name, address);
        Ok(())
    }

    fn disconnect_network(&self, network: &str, container: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        let net_name = state
            .network_key(network)
            .and_then(|k| state.networks.get(&k).map(|n| n.name.clone()))
            .ok_or_else(|| RuntimeError::NetworkNotFound(network.to_owned()))?;
        let c = state.container_mut(container)?;
        if c.info.networks.remove(&net_name).is_none() {
            return Err(RuntimeError::ExecFailed(format!(
                "container {container} is not connected to network {net_name}"
            )));
        }
        Ok(())
    }

    fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerInfo, RuntimeError> {
        let mut state = self.lock()?;
        if state.missing_images.contains(&spec.image) {
            return Err(RuntimeError::ImageNotFound(spec.image.clone()));
        }
        if state.container_key(&spec.name).is_some() {
            return Err(RuntimeError::CommandFailed {
                command: "run".to_owned(),
                code: 125,
                stderr: format!("container name {} is already in use", spec.name),
            });
        }
        if state.network_key(&spec.network).is_none() {
            return Err(RuntimeError::NetworkNotFound(spec.network.clone()));
        }

        let failure = state.fail_next_run.take();
        let id = state.allocate_id("ctr");
        let address = state.address_for(&spec.network);
        let mut info = ContainerInfo {
            id: id.clone(),
            name: spec.name.clone(),
            running: failure.is_none(),
            networks: BTreeMap::from([(spec.network.clone(), address)]),
            ports: BTreeMap::new(),
        };
        if spec.publish_all_ports {
            info.ports
                .insert("80/tcp".to_owned(), vec![(32768 + state.next_id).to_string()]);
        }

        match failure {
            Some(partial) => {
                if partial {
                    state.containers.insert(
                        id,
                        MockContainer {
                            info,
                            spec: spec.clone(),
                            files: BTreeMap::new(),
                        },
                    );
                }
                Err(RuntimeError::CommandFailed {
                    command: "run".to_owned(),
                    code: 125,
                    stderr: "injected failure starting container".to_owned(),
                })
            }
            None => {
                state.containers.insert(
                    id,
                    MockContainer {
                        info: info.clone(),
                        spec: spec.clone(),
                        files: BTreeMap::new(),
                    },
                );
                Ok(info)
            }
        }
    }

    fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        let state = self.lock()?;
        Ok(state
            .containers
            .values()
            .find(|c| c.info.name == name)
            .map(|c| c.info.clone()))
    }

    fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let mut state = self.lock()?;
        Ok(state.container_mut(id)?.info.clone())
    }

    fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        let c = state.container_mut(id)?;
        if !c.info.running {
            return Err(RuntimeError::ExecFailed(format!("container {id} is not running")));
        }
        c.info.running = false;
        Ok(())
    }

    fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        if std::mem::take(&mut state.fail_next_remove) {
            return Err(RuntimeError::ExecFailed(format!("injected failure removing container {id}")));
        }
        let key = state
            .container_key(id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_owned()))?;
        if !force && state.containers.get(&key).is_some_and(|c| c.info.running) {
            return Err(RuntimeError::ExecFailed(format!(
                "cannot remove running container {id}"
            )));
        }
        state.containers.remove(&key);
        Ok(())
    }

    fn exec(&self, container: &str, command: &[String]) -> Result<ExecOutput, RuntimeError> {
        let hooks: Vec<ExecHook> = self
            .hooks
            .lock()
            .map(|h| h.clone())
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?;

        let mut state = self.lock()?;
        let fail = std::mem::take(&mut state.fail_next_exec);
        let c = state.container_mut(container)?;
        if !c.info.running {
            return Err(RuntimeError::ExecFailed(format!(
                "container {container} is not running"
            )));
        }
        let name = c.info.name.clone();
        for hook in &hooks {
            hook(&name, command, &mut c.files);
        }
        state.exec_log.push((name, command.to_vec()));

        if fail {
            return Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "injected command failure".to_owned(),
            });
        }
        Ok(ExecOutput {
            exit_code: 0,
            stdout: format!("mock-exec: {}\n", command.join(" ")),
            stderr: String::new(),
        })
    }

    fn write_file(&self, container: &str, path: &str, content: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        let c = state.container_mut(container)?;
        if !c.info.running {
            return Err(RuntimeError::ExecFailed(format!(
                "container {container} is not running"
            )));
        }
        c.files.insert(path.to_owned(), content.to_owned());
        Ok(())
    }

    fn read_file(&self, container: &str, path: &str) -> Result<String, RuntimeError> {
        let mut state = self.lock()?;
        let c = state.container_mut(container)?;
        c.files
            .get(path)
            .cloned()
            .ok_or_else(|| RuntimeError::CommandFailed {
                command: format!("cat {path}"),
                code: 1,
                stderr: format!("{path}: No such file or directory"),
            })
    }
}
