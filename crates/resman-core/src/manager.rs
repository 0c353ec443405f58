use crate::concurrency::{OperationLock, StoreLock};
use crate::config::{Location, ManagerConfig};
use crate::events::{EventPublisher, HttpPublisher, NoopPublisher};
use crate::instance::{InstanceDetails, ResourceInstance};
use crate::instances::InstanceStore;
use crate::task::TaskHandle;
use crate::transition::{
    RequestStatus, ResponseContext, Transition, TransitionRequest, TransitionResponse,
    TransitionStatus,
};
use crate::CoreError;
use resman_runtime::ComputeBackend;
use resman_schema::{ResourceId, TypeDetails, TypeOverview, TypeRegistry, NETWORK_TYPE_NAME};
use resman_store::{RecordStore, RequestState, StoreLayout};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// State shared between the manager and its running transitions.
pub(crate) struct Shared {
    pub config: ManagerConfig,
    pub backend: Arc<dyn ComputeBackend>,
    pub records: RecordStore,
    pub instances: Arc<InstanceStore>,
    pub publisher: Box<dyn EventPublisher>,
    pub operation_lock: OperationLock,
    registry: RwLock<Arc<TypeRegistry>>,
}

impl Shared {
    /// The currently published type registry.
    pub fn registry(&self) -> Result<Arc<TypeRegistry>, CoreError> {
        self.registry
            .read()
            .map(|r| Arc::clone(&r))
            .map_err(|_| CoreError::Lock("type registry lock poisoned".to_owned()))
    }

    pub fn response_context(&self) -> ResponseContext {
        ResponseContext {
            asynchronous_transition_responses: self.config.features.asynchronous_transition_response,
        }
    }
}

/// Descriptor of this manager, as reported by the configuration endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerInfo {
    pub name: String,
    pub version: String,
    pub backend: String,
    pub supported_features: ResponseContext,
    pub publish_all_ports: bool,
    pub locations: Vec<Location>,
}

/// Central coordinator of resource types, instances and transitions.
///
/// Holds an exclusive lock on its data directory for its whole lifetime.
pub struct ResourceManager {
    shared: Arc<Shared>,
    next_request_id: AtomicU64,
    _lock: StoreLock,
}

impl ResourceManager {
    /// Open a manager publishing events as `config` describes.
    pub fn open(config: ManagerConfig, backend: Arc<dyn ComputeBackend>) -> Result<Self, CoreError> {
        let publisher = publisher_for(&config);
        Self::with_publisher(config, backend, publisher)
    }

    pub fn with_publisher(
        config: ManagerConfig,
        backend: Arc<dyn ComputeBackend>,
        publisher: Box<dyn EventPublisher>,
    ) -> Result<Self, CoreError> {
        info!(
            "starting resource manager {} on {} (backend {})",
            config.name,
            config.data_dir.display(),
            backend.name()
        );
        let layout = StoreLayout::new(&config.data_dir);
        layout.initialize()?;
        let lock = StoreLock::try_acquire(&layout.lock_file())?.ok_or_else(|| {
            CoreError::Lock(format!(
                "data directory {} is in use by another manager",
                config.data_dir.display()
            ))
        })?;

        let records = RecordStore::open(layout)?;
        if config.persistence.purge_on_start {
            let purged = records.purge()?;
            if purged > 0 {
                info!("purged {purged} transition records from a previous run");
            }
        }
        let next_request_id = records.max_request_id()?.map_or(1, |id| id + 1);

        let mut registry = builtin_registry(&config)?;
        let instances = Arc::new(InstanceStore::new());
        discover_networks(&config, backend.as_ref(), &registry, &instances)?;
        load_resource_dirs(&mut registry, &config);
        let registry = Arc::new(registry);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                backend,
                records,
                instances,
                publisher,
                operation_lock: OperationLock::new(),
                registry: RwLock::new(registry),
            }),
            next_request_id: AtomicU64::new(next_request_id),
            _lock: lock,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.shared.backend.as_ref()
    }

    /// Validate `request` and start it in the background. The returned
    /// response always reports IN_PROGRESS.
    pub fn submit(&self, request: TransitionRequest) -> Result<(TransitionResponse, TaskHandle), CoreError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        info!(
            "transition request {request_id}: {} (resource {})",
            request.transition_name.as_deref().unwrap_or("<none>"),
            request.resource_id.as_deref().unwrap_or("new")
        );
        let (transition, task) = Transition::prepare(&self.shared, request_id, request)?;
        let response = TransitionResponse {
            request_id,
            request_state: RequestState::InProgress,
            context: self.shared.response_context(),
        };
        let handle = TaskHandle::spawn(Arc::clone(&self.shared), task, transition)?;
        Ok((response, handle))
    }

    /// Full status of a transition request.
    pub fn transition(&self, request_id: u64) -> Result<TransitionStatus, CoreError> {
        let (_, record) = self
            .shared
            .records
            .find_by_request_id(request_id)?
            .ok_or(CoreError::TransitionNotFound(request_id))?;
        Ok(TransitionStatus::new(record, self.shared.response_context()))
    }

    pub fn transition_status(&self, request_id: u64) -> Result<RequestStatus, CoreError> {
        self.transition(request_id).map(|s| s.summary())
    }

    pub fn instance(&self, resource_id: &str) -> Result<InstanceDetails, CoreError> {
        let id: ResourceId = resource_id
            .parse()
            .map_err(|_| CoreError::InstanceNotFound(resource_id.to_owned()))?;
        self.shared
            .instances
            .get(id)?
            .map(|i| i.details(&self.shared.config.name))
            .ok_or_else(|| CoreError::InstanceNotFound(resource_id.to_owned()))
    }

    /// Instances in `location`, optionally of one type.
    pub fn search_instances(
        &self,
        location: &str,
        type_name: Option<&str>,
    ) -> Result<Vec<InstanceDetails>, CoreError> {
        self.location(location)?;
        Ok(self
            .shared
            .instances
            .search(location, type_name)?
            .iter()
            .map(|i| i.details(&self.shared.config.name))
            .collect())
    }

    pub fn resource_types(&self) -> Result<Vec<TypeOverview>, CoreError> {
        Ok(self.shared.registry()?.overview_list())
    }

    pub fn resource_type(&self, name: &str) -> Result<TypeDetails, CoreError> {
        Ok(self.shared.registry()?.details(name)?)
    }

    /// Re-read every type directory. Existing instances keep the type they
    /// were created with.
    pub fn reload_types(&self) -> Result<Vec<TypeOverview>, CoreError> {
        info!("reloading resource types");
        let fresh = Arc::new(load_registry(&self.shared.config)?);
        let overview = fresh.overview_list();
        let mut registry = self
            .shared
            .registry
            .write()
            .map_err(|_| CoreError::Lock("type registry lock poisoned".to_owned()))?;
        *registry = fresh;
        Ok(overview)
    }

    pub fn locations(&self) -> &[Location] {
        &self.shared.config.locations
    }

    pub fn location(&self, name: &str) -> Result<&Location, CoreError> {
        self.shared
            .config
            .location(name)
            .ok_or_else(|| CoreError::UnknownLocationInRequest(name.to_owned()))
    }

    pub fn info(&self) -> ManagerInfo {
        ManagerInfo {
            name: self.shared.config.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            backend: self.shared.backend.name().to_owned(),
            supported_features: self.shared.response_context(),
            publish_all_ports: self.shared.config.publish_all_ports,
            locations: self.shared.config.locations.clone(),
        }
    }
}

fn publisher_for(config: &ManagerConfig) -> Box<dyn EventPublisher> {
    match &config.events {
        Some(events) if config.features.asynchronous_transition_response => {
            info!("publishing lifecycle events to {}/{}", events.url, events.topic);
            Box::new(HttpPublisher::new(&events.url, &events.topic))
        }
        _ => {
            debug!("lifecycle event publishing disabled");
            Box::new(NoopPublisher)
        }
    }
}

/// Built-in types, then internal types, then every resource directory.
fn load_registry(config: &ManagerConfig) -> Result<TypeRegistry, CoreError> {
    let mut registry = builtin_registry(config)?;
    load_resource_dirs(&mut registry, config);
    Ok(registry)
}

/// Built-in and internal types: everything network discovery relies on.
fn builtin_registry(config: &ManagerConfig) -> Result<TypeRegistry, CoreError> {
    let mut registry = TypeRegistry::with_builtins()?;
    if let Some(dir) = &config.internal_dir {
        load_dir(&mut registry, dir, true);
    }
    Ok(registry)
}

fn load_resource_dirs(registry: &mut TypeRegistry, config: &ManagerConfig) {
    for dir in &config.resource_dirs {
        load_dir(registry, dir, false);
    }
    info!("{} resource types loaded", registry.len());
}

fn load_dir(registry: &mut TypeRegistry, dir: &Path, internal: bool) {
    match registry.load_directory(dir, internal) {
        Ok(added) => debug!("loaded {added} resource types from {}", dir.display()),
        Err(e) => warn!("cannot read resource directory {}: {e}", dir.display()),
    }
}

/// Register every network already on the backend as a read-only instance
/// in the first location.
fn discover_networks(
    config: &ManagerConfig,
    backend: &dyn ComputeBackend,
    registry: &TypeRegistry,
    instances: &InstanceStore,
) -> Result<(), CoreError> {
    let Some(location) = config.first_location() else {
        return Ok(());
    };
    let network_type = registry.lookup(NETWORK_TYPE_NAME)?;
    let networks = match backend.list_networks() {
        Ok(networks) => networks,
        Err(e) => {
            warn!("network discovery failed: {e}");
            return Ok(());
        }
    };
    for info in &networks {
        let id = instances.insert_with(|id| {
            ResourceInstance::discovered_network(id, Arc::clone(&network_type), &location.name, info)
        })?;
        debug!("discovered network {} as resource {id}", info.name);
    }
    info!("discovered {} existing networks", networks.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use resman_runtime::MockBackend;

    fn config(dir: &Path) -> ManagerConfig {
        ManagerConfig {
            data_dir: dir.join("data"),
            locations: vec![Location::new("local"), Location::new("remote")],
            ..ManagerConfig::default()
        }
    }

    #[test]
    fn startup_discovers_backend_networks() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ResourceManager::open(config(dir.path()), Arc::new(MockBackend::new())).unwrap();
        let found = manager.search_instances("local", Some(NETWORK_TYPE_NAME)).unwrap();
        let mut names: Vec<_> = found.iter().map(|d| d.resource_name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["bridge", "host", "none"]);
        assert!(manager.search_instances("remote", None).unwrap().is_empty());
    }

    #[test]
    fn discovered_networks_precede_resource_directories() {
        let dir = tempfile::tempdir().unwrap();
        let types = dir.path().join("types").join("web");
        std::fs::create_dir_all(&types).unwrap();
        std::fs::write(types.join("resource.yaml"), "lifecycle:\n  - Install\n").unwrap();
        let config = ManagerConfig {
            resource_dirs: vec![dir.path().join("types")],
            ..config(dir.path())
        };
        let manager = ResourceManager::open(config, Arc::new(MockBackend::new())).unwrap();

        let mut ids: Vec<u64> = manager
            .search_instances("local", Some(NETWORK_TYPE_NAME))
            .unwrap()
            .iter()
            .map(|d| d.resource_id.get())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(manager.resource_types().unwrap().len(), 2);
        assert!(manager.resource_type("resource::web::1.0").is_ok());
    }

    #[test]
    fn second_manager_on_same_data_dir_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let _first = ResourceManager::open(config(dir.path()), Arc::new(MockBackend::empty())).unwrap();
        assert!(matches!(
            ResourceManager::open(config(dir.path()), Arc::new(MockBackend::empty())),
            Err(CoreError::Lock(_))
        ));
    }

    #[test]
    fn unknown_queries_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ResourceManager::open(config(dir.path()), Arc::new(MockBackend::empty())).unwrap();
        assert!(matches!(manager.transition(99), Err(CoreError::TransitionNotFound(99))));
        assert!(matches!(manager.instance("12"), Err(CoreError::InstanceNotFound(_))));
        assert!(matches!(manager.instance("abc"), Err(CoreError::InstanceNotFound(_))));
        assert!(matches!(
            manager.search_instances("moon", None),
            Err(CoreError::UnknownLocationInRequest(_))
        ));
        assert!(matches!(
            manager.resource_type("resource::nope::1.0"),
            Err(CoreError::TypeNotFound(_))
        ));
    }

    #[test]
    fn info_describes_manager() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ResourceManager::open(config(dir.path()), Arc::new(MockBackend::empty())).unwrap();
        let info = manager.info();
        assert_eq!(info.name, "docker-rm");
        assert_eq!(info.backend, "mock");
        assert!(info.supported_features.asynchronous_transition_responses);
        assert_eq!(manager.locations().len(), 2);
        assert_eq!(manager.resource_types().unwrap().len(), 1);
    }
}
