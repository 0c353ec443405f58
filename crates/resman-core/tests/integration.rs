//! End-to-end transitions against the mock backend.

use resman_core::{
    ChannelPublisher, CoreError, LifecycleEvent, Location, ManagerConfig, PersistenceConfig,
    ResourceManager, TransitionRequest,
};
use resman_runtime::{ComputeBackend, MockBackend};
use resman_store::RequestState;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

const NETWORK: &str = "resource::docker-network::1.0";
const WEB: &str = "resource::web::1.0";

const WEB_DESCRIPTOR: &str = r"description: test web server
properties:
  port:
    type: string
    default: '80'
  admin_user:
    type: string
    required: true
  motd:
    type: string
    required: false
  docker_ipaddr:
    type: string
    read-only: true
lifecycle:
  - Install
  - Configure
  - Start
  - Stop
  - Uninstall
operations:
  reload:
    properties:
      mode:
        type: string
        required: true
";

const WEB_LIFECYCLE: &str = r"lifecycle:
  Install: /opt/install.sh
  Start: /opt/start.sh
  Uninstall: /opt/uninstall.sh
";

const WEB_OPERATIONS: &str = r"operations:
  reload: /opt/reload.sh
";

fn write_type(types_dir: &Path, kind: &str) {
    let root = types_dir.join(kind);
    fs::create_dir_all(root.join("lifecycle")).unwrap();
    fs::create_dir_all(root.join("operations")).unwrap();
    fs::write(root.join("resource.yaml"), WEB_DESCRIPTOR).unwrap();
    fs::write(root.join("lifecycle/lifecycle.yaml"), WEB_LIFECYCLE).unwrap();
    fs::write(root.join("operations/operations.yaml"), WEB_OPERATIONS).unwrap();
}

fn config(dir: &Path) -> ManagerConfig {
    ManagerConfig {
        data_dir: dir.join("data"),
        resource_dirs: vec![dir.join("types")],
        locations: vec![Location::new("loc1"), Location::new("loc2")],
        ..ManagerConfig::default()
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    backend: Arc<MockBackend>,
    manager: ResourceManager,
    events: Receiver<LifecycleEvent>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    write_type(&dir.path().join("types"), "web");
    let backend = Arc::new(MockBackend::new());
    let (publisher, events) = ChannelPublisher::new();
    let manager =
        ResourceManager::with_publisher(config(dir.path()), backend.clone(), Box::new(publisher))
            .unwrap();
    Fixture {
        dir,
        backend,
        manager,
        events,
    }
}

impl Fixture {
    fn records_dir(&self) -> PathBuf {
        self.dir.path().join("data").join("transitions")
    }

    fn persisted_records(&self) -> usize {
        fs::read_dir(self.records_dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
            .count()
    }

    fn next_event(&self) -> LifecycleEvent {
        self.events.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    /// Submit and wait; returns the terminal record's resource id.
    fn run(&self, request: TransitionRequest) -> (RequestState, String) {
        let (_, handle) = self.manager.submit(request).unwrap();
        let record = handle.wait().unwrap();
        self.next_event();
        (record.request_state, record.resource_id.unwrap())
    }

    fn install_web(&self) -> String {
        let (state, id) = self.run(
            TransitionRequest::new("Install")
                .with_type(WEB)
                .with_name("web-a")
                .with_location("loc1")
                .with_property("admin_user", "root"),
        );
        assert_eq!(state, RequestState::Completed);
        id
    }
}

const DISCOVERED_NETWORKS: [&str; 3] = ["bridge", "host", "none"];

impl Fixture {
    /// Nothing created by a failed install is left on the backend.
    fn assert_backend_untouched(&self) {
        assert!(self.backend.container_names().is_empty());
        let mut networks = self.backend.network_names();
        networks.sort();
        assert_eq!(networks, DISCOVERED_NETWORKS);
    }
}

fn network_install(name: &str) -> TransitionRequest {
    TransitionRequest::new("Install")
        .with_type(NETWORK)
        .with_property("networkname", name)
}

#[test]
fn network_install_completes_and_publishes_event() {
    let fx = fixture();
    let (response, handle) = fx.manager.submit(network_install("net1")).unwrap();
    assert_eq!(response.request_state, RequestState::InProgress);
    assert!(response.context.asynchronous_transition_responses);

    let record = handle.wait().unwrap();
    assert_eq!(record.request_id, response.request_id);
    assert_eq!(record.request_state, RequestState::Completed);
    assert!(record.finished_at.is_some());

    let event = fx.next_event();
    assert_eq!(event.request_id, response.request_id);
    assert_eq!(event.request_state, RequestState::Completed);
    assert_eq!(event.resource_instance.properties["networkname"], json!("net1"));
    assert_eq!(event.resource_instance.deployment_location, "loc1");
    assert_eq!(event.resource_instance.created_at, event.finished_at);

    let internal = &event.resource_instance.internal_resource_instances[0];
    assert_eq!(internal.kind, "resource__docker_network__1_0");
    assert_eq!(
        internal.id.as_ref().map(|id| json!(id)),
        Some(event.resource_instance.properties["networkid"].clone())
    );

    let status = fx.manager.transition(response.request_id).unwrap();
    assert_eq!(status.record.request_state, RequestState::Completed);
    assert_eq!(status.record.resource_id, event.resource_id);

    let details = fx
        .manager
        .instance(event.resource_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(details.resource_name, "net1");
    assert_eq!(details.properties["bridgename"], json!(format!("net{}", details.resource_id)));
    assert!(fx.backend.network_names().contains(&"net1".to_owned()));
}

#[test]
fn event_carries_request_routing_fields() {
    let fx = fixture();
    let (_, handle) = fx
        .manager
        .submit(
            network_install("net5")
                .with_metric_key("metric-5")
                .with_resource_manager_id("rm-east"),
        )
        .unwrap();
    handle.wait().unwrap();

    let event = fx.next_event();
    assert_eq!(event.resource_manager_id.as_deref(), Some("rm-east"));
    assert_eq!(event.deployment_location.as_deref(), Some("loc1"));
    assert_eq!(event.metric_key.as_deref(), Some("metric-5"));
    assert_eq!(event.resource_instance.resource_manager_id, "rm-east");

    let (_, handle) = fx.manager.submit(network_install("net6")).unwrap();
    handle.wait().unwrap();
    let event = fx.next_event();
    assert_eq!(event.resource_manager_id, None);
    assert_eq!(event.resource_instance.resource_manager_id, "docker-rm");
}

#[test]
fn repeated_network_install_reuses_instance() {
    let fx = fixture();
    let (_, first) = fx.run(network_install("net1"));
    let (state, second) = fx.run(network_install("net1"));
    assert_eq!(state, RequestState::Completed);
    assert_eq!(first, second);
    assert_eq!(fx.backend.networks_created(), 1);
    assert_eq!(
        fx.manager
            .search_instances("loc1", Some(NETWORK))
            .unwrap()
            .iter()
            .filter(|d| d.resource_name == "net1")
            .count(),
        1
    );
}

#[test]
fn installing_a_discovered_network_touches_nothing() {
    let fx = fixture();
    let bridge = fx
        .manager
        .search_instances("loc1", Some(NETWORK))
        .unwrap()
        .into_iter()
        .find(|d| d.resource_name == "bridge")
        .unwrap();
    let (state, id) = fx.run(network_install("bridge"));
    assert_eq!(state, RequestState::Completed);
    assert_eq!(id, bridge.resource_id.to_string());
    assert_eq!(fx.backend.networks_created(), 0);
}

#[test]
fn unknown_instance_is_rejected_synchronously() {
    let fx = fixture();
    let err = fx
        .manager
        .submit(TransitionRequest::new("Start").with_resource_id("999"))
        .unwrap_err();
    assert!(matches!(err, CoreError::InstanceNotFound(ref id) if id == "999"));
    assert_eq!(fx.persisted_records(), 0);
}

#[test]
fn unknown_type_is_rejected_without_record() {
    let fx = fixture();
    let err = fx
        .manager
        .submit(
            TransitionRequest::new("Install")
                .with_type("resource::unknown::1.0")
                .with_location("loc1"),
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::TypeNotFound(_)));
    assert_eq!(fx.persisted_records(), 0);
}

#[test]
fn request_validation_errors() {
    let fx = fixture();
    let id = fx.install_web();
    let m = &fx.manager;

    let mut no_name = TransitionRequest::new("Start").with_resource_id(&id);
    no_name.transition_name = None;
    assert!(matches!(m.submit(no_name), Err(CoreError::InvalidTransition(_))));

    assert!(matches!(
        m.submit(TransitionRequest::new("Install").with_resource_id(&id)),
        Err(CoreError::InvalidTransition(_))
    ));
    assert!(matches!(
        m.submit(TransitionRequest::new("Integrity").with_resource_id(&id)),
        Err(CoreError::InvalidTransition(_))
    ));
    assert!(matches!(
        m.submit(TransitionRequest::new("explode").with_resource_id(&id)),
        Err(CoreError::InvalidTransition(_))
    ));
    assert!(matches!(
        m.submit(TransitionRequest::new("Start").with_type(WEB).with_location("loc1")),
        Err(CoreError::InvalidTransition(_))
    ));
    assert!(matches!(
        m.submit(TransitionRequest::new("Install").with_location("loc1")),
        Err(CoreError::TypeMissingFromRequest)
    ));
    assert!(matches!(
        m.submit(TransitionRequest::new("Install").with_type(WEB).with_property("admin_user", "x")),
        Err(CoreError::NoLocationInRequest)
    ));
    assert!(matches!(
        m.submit(
            TransitionRequest::new("Install")
                .with_type(WEB)
                .with_location("moon")
                .with_property("admin_user", "x")
        ),
        Err(CoreError::UnknownLocationInRequest(ref l)) if l == "moon"
    ));

    // only the install survives on disk
    assert_eq!(fx.persisted_records(), 1);
}

#[test]
fn missing_required_property_is_named() {
    let fx = fixture();
    let err = fx
        .manager
        .submit(TransitionRequest::new("Install").with_type(WEB).with_location("loc1"))
        .unwrap_err();
    assert!(matches!(err, CoreError::MissingProperty(ref p) if p == "admin_user"));

    let err = fx.manager.submit(TransitionRequest::new("Install").with_type(NETWORK)).unwrap_err();
    assert!(matches!(err, CoreError::MissingProperty(ref p) if p == "networkname"));
}

#[test]
fn install_materializes_every_schema_key() {
    let fx = fixture();
    let id = fx.install_web();
    let details = fx.manager.instance(&id).unwrap();
    for key in ["port", "admin_user", "motd", "docker_ipaddr"] {
        assert!(details.properties.contains_key(key), "missing {key}");
    }
    assert_eq!(details.properties["port"], json!("80"));
    assert_eq!(details.properties["admin_user"], json!("root"));
    assert_eq!(details.resource_manager_id, "docker-rm");
    assert_eq!(details.internal_resource_instances[0].kind, "docker container");
    assert!(fx.backend.container_names().contains(&format!("dockerrm_web{id}")));
}

#[test]
fn metric_key_is_recorded_in_properties() {
    let fx = fixture();
    let (_, id) = fx.run(
        TransitionRequest::new("Install")
            .with_type(WEB)
            .with_location("loc1")
            .with_property("admin_user", "root")
            .with_metric_key("metric-9"),
    );
    let details = fx.manager.instance(&id).unwrap();
    assert_eq!(details.properties["metricKey"], json!("metric-9"));
    let spec = fx.backend.container_spec(&format!("dockerrm_web{id}")).unwrap();
    assert!(spec.env.contains(&("RM_PROP_metricKey".to_owned(), "metric-9".to_owned())));
}

#[test]
fn failed_launch_leaves_no_trace() {
    let fx = fixture();
    fx.backend.fail_next_run(true);
    let (_, handle) = fx
        .manager
        .submit(
            TransitionRequest::new("Install")
                .with_type(WEB)
                .with_location("loc1")
                .with_property("admin_user", "root"),
        )
        .unwrap();
    let record = handle.wait().unwrap();
    assert_eq!(record.request_state, RequestState::Failed);
    assert!(record
        .request_state_reason
        .as_deref()
        .unwrap()
        .starts_with("Failure from Virtual Infrastructure:"));

    let event = fx.next_event();
    assert_eq!(event.request_state, RequestState::Failed);
    fx.assert_backend_untouched();
    assert!(fx.manager.search_instances("loc1", Some(WEB)).unwrap().is_empty());
    assert!(fx.manager.instance(record.resource_id.as_deref().unwrap()).is_err());
}

#[test]
fn missing_image_fails_the_install() {
    let fx = fixture();
    fx.backend.mark_image_missing("dockerrm_web");
    let (state, _) = fx.run(
        TransitionRequest::new("Install")
            .with_type(WEB)
            .with_location("loc1")
            .with_property("admin_user", "root"),
    );
    assert_eq!(state, RequestState::Failed);
    assert!(fx.manager.search_instances("loc1", Some(WEB)).unwrap().is_empty());
    fx.assert_backend_untouched();
}

#[test]
fn failed_install_command_removes_launched_container() {
    let fx = fixture();
    fx.backend.fail_next_exec();
    let (state, resource_id) = fx.run(
        TransitionRequest::new("Install")
            .with_type(WEB)
            .with_location("loc1")
            .with_property("admin_user", "root"),
    );
    assert_eq!(state, RequestState::Failed);
    assert!(fx.manager.instance(&resource_id).is_err());
    assert!(fx.manager.search_instances("loc1", Some(WEB)).unwrap().is_empty());
    fx.assert_backend_untouched();
}

#[test]
fn workload_lifecycle_end_to_end() {
    let fx = fixture();
    let (_, handle) = fx
        .manager
        .submit(
            TransitionRequest::new("Install")
                .with_type(WEB)
                .with_location("loc1")
                .with_property("admin_user", "root"),
        )
        .unwrap();
    let install = handle.wait().unwrap();
    fx.next_event();
    let id = install.resource_id.clone().unwrap();
    let container = format!("dockerrm_web{id}");

    let (_, handle) = fx.manager.submit(TransitionRequest::new("Start").with_resource_id(&id)).unwrap();
    let start = handle.wait().unwrap();
    assert_eq!(start.request_state, RequestState::Completed);
    let event = fx.next_event();
    assert_eq!(event.resource_instance.created_at, install.finished_at);

    let (state, _) = fx.run(TransitionRequest::new("Configure").with_resource_id(&id));
    assert_eq!(state, RequestState::Completed);
    let (state, _) = fx.run(TransitionRequest::new("stop").with_resource_id(&id));
    assert_eq!(state, RequestState::Completed);

    let commands: Vec<String> = fx
        .backend
        .executed_commands()
        .into_iter()
        .filter(|(c, _)| *c == container)
        .map(|(_, argv)| argv.join(" "))
        .collect();
    assert_eq!(commands, vec!["/opt/install.sh", "/opt/start.sh"]);

    let (state, _) = fx.run(TransitionRequest::new("Uninstall").with_resource_id(&id));
    assert_eq!(state, RequestState::Completed);
    assert!(fx.backend.container_names().is_empty());
    assert!(matches!(fx.manager.instance(&id), Err(CoreError::InstanceNotFound(_))));
}

#[test]
fn command_failure_fails_transition_but_keeps_instance() {
    let fx = fixture();
    let id = fx.install_web();
    fx.backend.fail_next_exec();
    let (state, _) = fx.run(TransitionRequest::new("Start").with_resource_id(&id));
    assert_eq!(state, RequestState::Failed);
    assert!(fx.manager.instance(&id).is_ok());

    let (state, _) = fx.run(TransitionRequest::new("Start").with_resource_id(&id));
    assert_eq!(state, RequestState::Completed);
}

#[test]
fn lifecycle_command_updates_existing_properties_only() {
    let fx = fixture();
    fx.backend.add_exec_hook(|_, command, files| {
        if command.first().map(String::as_str) == Some("/opt/start.sh") {
            files.insert(
                "/etc/rmparams".to_owned(),
                "port: '8443'\nsurprise: value\n".to_owned(),
            );
        }
    });
    let id = fx.install_web();
    fx.run(TransitionRequest::new("Start").with_resource_id(&id));
    let details = fx.manager.instance(&id).unwrap();
    assert_eq!(details.properties["port"], json!("8443"));
    assert!(!details.properties.contains_key("surprise"));
}

#[test]
fn operation_validates_and_runs() {
    let fx = fixture();
    let id = fx.install_web();

    let err = fx
        .manager
        .submit(TransitionRequest::new("reload").with_resource_id(&id))
        .unwrap_err();
    assert!(matches!(err, CoreError::MissingProperty(ref p) if p == "mode"));

    let (state, _) = fx.run(
        TransitionRequest::new("reload")
            .with_resource_id(&id)
            .with_property("mode", "graceful"),
    );
    assert_eq!(state, RequestState::Completed);
    let params = fx
        .backend
        .file(&format!("dockerrm_web{id}"), "/etc/opparams")
        .unwrap();
    assert!(params.contains("mode: graceful"));
}

#[test]
fn add_and_remove_network_operations() {
    let fx = fixture();
    let (_, net_id) = fx.run(network_install("data"));
    let network_id = fx.manager.instance(&net_id).unwrap().properties["networkid"]
        .as_str()
        .unwrap()
        .to_owned();
    let id = fx.install_web();
    let container = format!("dockerrm_web{id}");

    let (state, _) = fx.run(
        TransitionRequest::new("addNetwork")
            .with_resource_id(&id)
            .with_property("networkid", network_id.as_str()),
    );
    assert_eq!(state, RequestState::Completed);
    assert!(fx.backend.inspect_container(&container).unwrap().networks.contains_key("data"));

    let (state, _) = fx.run(
        TransitionRequest::new("removeNetwork")
            .with_resource_id(&id)
            .with_property("networkid", network_id.as_str()),
    );
    assert_eq!(state, RequestState::Completed);
    assert!(!fx.backend.inspect_container(&container).unwrap().networks.contains_key("data"));

    assert!(matches!(
        fx.manager.submit(TransitionRequest::new("addNetwork").with_resource_id(&id)),
        Err(CoreError::MissingProperty(_))
    ));
}

#[test]
fn managed_network_uninstall_removes_it() {
    let fx = fixture();
    let (_, id) = fx.run(network_install("net1"));
    let (state, _) = fx.run(TransitionRequest::new("Uninstall").with_resource_id(&id));
    assert_eq!(state, RequestState::Completed);
    assert!(!fx.backend.network_names().contains(&"net1".to_owned()));
    assert!(fx.manager.instance(&id).is_err());
}

#[test]
fn discovered_network_uninstall_is_a_no_op() {
    let fx = fixture();
    let bridge = fx
        .manager
        .search_instances("loc1", Some(NETWORK))
        .unwrap()
        .into_iter()
        .find(|d| d.resource_name == "bridge")
        .unwrap();
    let id = bridge.resource_id.to_string();
    let (state, _) = fx.run(TransitionRequest::new("Uninstall").with_resource_id(&id));
    assert_eq!(state, RequestState::Completed);
    assert!(fx.backend.network_names().contains(&"bridge".to_owned()));
    assert!(fx.manager.instance(&id).is_ok());
}

#[test]
fn finished_at_is_set_once_on_terminal_state() {
    let fx = fixture();
    let (response, handle) = fx.manager.submit(network_install("net2")).unwrap();
    let early = fx.manager.transition_status(response.request_id).unwrap();
    if early.request_state == RequestState::InProgress {
        assert!(early.finished_at.is_none());
    }
    let record = handle.wait().unwrap();
    let after = fx.manager.transition_status(response.request_id).unwrap();
    assert_eq!(after.request_state, RequestState::Completed);
    assert_eq!(after.finished_at, record.finished_at);
    assert!(after.finished_at.is_some());
}

#[test]
fn event_follows_persisted_status() {
    let fx = fixture();
    let (response, _handle) = fx.manager.submit(network_install("net3")).unwrap();
    let event = fx.next_event();
    let status = fx.manager.transition_status(response.request_id).unwrap();
    assert_eq!(status.request_state, event.request_state);
    assert_eq!(status.finished_at, event.finished_at);
}

#[test]
fn resource_ids_are_never_reused() {
    let fx = fixture();
    let (_, first) = fx.run(network_install("a"));
    fx.run(TransitionRequest::new("Uninstall").with_resource_id(&first));
    let (_, second) = fx.run(network_install("a"));
    assert!(second.parse::<u64>().unwrap() > first.parse::<u64>().unwrap());
}

#[test]
fn reload_adds_types_and_keeps_instances() {
    let fx = fixture();
    let id = fx.install_web();
    assert!(fx.manager.resource_type("resource::api::1.0").is_err());

    write_type(&fx.dir.path().join("types"), "api");
    let types = fx.manager.reload_types().unwrap();
    assert!(types.iter().any(|t| t.name == "resource::api::1.0"));
    let details = fx.manager.resource_type("resource::api::1.0").unwrap();
    assert_eq!(details.state, "PUBLISHED");
    assert!(details.descriptor.contains("admin_user"));
    assert!(fx.manager.instance(&id).is_ok());
}

#[test]
fn restart_without_purge_keeps_records_and_numbering() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.persistence = PersistenceConfig {
        purge_on_start: false,
    };
    let backend = Arc::new(MockBackend::empty());
    let first_id = {
        let manager = ResourceManager::open(cfg.clone(), backend.clone()).unwrap();
        let (response, handle) = manager.submit(network_install("net1")).unwrap();
        handle.wait().unwrap();
        response.request_id
    };

    let manager = ResourceManager::open(cfg.clone(), backend.clone()).unwrap();
    assert_eq!(
        manager.transition(first_id).unwrap().record.request_state,
        RequestState::Completed
    );
    let (response, handle) = manager.submit(network_install("net9")).unwrap();
    handle.wait().unwrap();
    assert!(response.request_id > first_id);
    drop(manager);

    cfg.persistence.purge_on_start = true;
    let manager = ResourceManager::open(cfg, backend).unwrap();
    assert!(matches!(
        manager.transition(first_id),
        Err(CoreError::TransitionNotFound(_))
    ));
}
