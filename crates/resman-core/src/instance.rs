use crate::events::InternalResourceInstance;
use crate::{network, workload, CoreError};
use resman_runtime::{ComputeBackend, NetworkInfo};
use resman_schema::{seed_properties, Properties, ResourceId, ResourceType, StandardTransition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// The backend object a resource instance is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendBinding {
    Container { id: String, name: String },
    Network { id: String, name: String },
}

impl BackendBinding {
    pub fn id(&self) -> &str {
        match self {
            BackendBinding::Container { id, .. } | BackendBinding::Network { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            BackendBinding::Container { name, .. } | BackendBinding::Network { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    Workload,
    Network,
}

/// What a transition did to its instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    /// Nothing to run (no lifecycle configuration); reported as completed.
    NoResult(String),
    /// The instance is gone and must leave the store.
    Removed,
    Failed(String),
}

/// Backend access for one transition run.
#[derive(Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub backend: &'a dyn ComputeBackend,
    pub publish_all_ports: bool,
}

/// A live resource instance held in the manager's arena.
#[derive(Debug, Clone)]
pub struct ResourceInstance {
    pub resource_id: ResourceId,
    pub resource_type: Arc<ResourceType>,
    pub name: String,
    pub location: String,
    pub properties: Properties,
    pub created_at: String,
    pub last_modified_at: String,
    /// `finishedAt` of the first install request run against this instance.
    pub installed_at: Option<String>,
    /// Discovered networks are never removed from the backend.
    pub readonly: bool,
    pub binding: Option<BackendBinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDetails {
    pub resource_id: ResourceId,
    pub resource_name: String,
    pub resource_type: String,
    pub resource_manager_id: String,
    pub deployment_location: String,
    pub properties: Properties,
    pub created_at: String,
    pub last_modified_at: String,
    pub internal_resource_instances: Vec<InternalResourceInstance>,
}

impl ResourceInstance {
    /// A new instance whose properties start from the type's schema and are
    /// then overlaid with `overrides`.
    pub fn new(
        resource_id: ResourceId,
        resource_type: Arc<ResourceType>,
        name: &str,
        location: &str,
        overrides: Properties,
    ) -> Self {
        let mut properties = seed_properties(resource_type.properties());
        properties.extend(overrides);
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            resource_id,
            resource_type,
            name: name.to_owned(),
            location: location.to_owned(),
            properties,
            created_at: now.clone(),
            last_modified_at: now,
            installed_at: None,
            readonly: false,
            binding: None,
        }
    }

    /// Read-only instance for a network that already existed on the backend.
    pub fn discovered_network(
        resource_id: ResourceId,
        resource_type: Arc<ResourceType>,
        location: &str,
        info: &NetworkInfo,
    ) -> Self {
        let mut properties = Properties::new();
        properties.insert("networkname".to_owned(), Value::String(info.name.clone()));
        properties.insert("networkid".to_owned(), Value::String(info.id.clone()));
        properties.insert(
            "subnet".to_owned(),
            Value::String(info.subnet.clone().unwrap_or_default()),
        );
        properties.insert(
            "gateway".to_owned(),
            Value::String(info.gateway.clone().unwrap_or_default()),
        );
        let mut instance = Self::new(resource_id, resource_type, &info.name, location, properties);
        instance.readonly = true;
        instance.binding = Some(BackendBinding::Network {
            id: info.id.clone(),
            name: info.name.clone(),
        });
        instance
    }

    pub fn kind(&self) -> InstanceKind {
        if self.resource_type.is_network() {
            InstanceKind::Network
        } else {
            InstanceKind::Workload
        }
    }

    pub fn type_name(&self) -> &str {
        self.resource_type.name.as_str()
    }

    pub fn property_str(&self, name: &str) -> Option<String> {
        self.properties
            .get(name)
            .map(resman_schema::display_value)
            .filter(|s| !s.is_empty())
    }

    /// Network instances are identified by location, type and network name.
    pub fn is_network_named(&self, location: &str, type_name: &str, networkname: &str) -> bool {
        self.location == location
            && self.type_name() == type_name
            && (self.name == networkname
                || self.property_str("networkname").as_deref() == Some(networkname))
    }

    pub fn touch(&mut self) {
        self.last_modified_at = chrono::Utc::now().to_rfc3339();
    }

    pub fn internal_resource_instances(&self) -> Vec<InternalResourceInstance> {
        match &self.binding {
            Some(BackendBinding::Container { id, name }) => vec![InternalResourceInstance {
                id: Some(id.clone()),
                name: name.clone(),
                kind: "docker container".to_owned(),
            }],
            Some(BackendBinding::Network { id, name }) => vec![InternalResourceInstance {
                id: Some(id.clone()),
                name: name.clone(),
                kind: "docker network".to_owned(),
            }],
            None => Vec::new(),
        }
    }

    pub fn details(&self, resource_manager_id: &str) -> InstanceDetails {
        InstanceDetails {
            resource_id: self.resource_id,
            resource_name: self.name.clone(),
            resource_type: self.type_name().to_owned(),
            resource_manager_id: resource_manager_id.to_owned(),
            deployment_location: self.location.clone(),
            properties: self.properties.clone(),
            created_at: self.created_at.clone(),
            last_modified_at: self.last_modified_at.clone(),
            internal_resource_instances: self.internal_resource_instances(),
        }
    }

    pub fn run_standard_transition(
        &mut self,
        ctx: ExecutionContext<'_>,
        transition: StandardTransition,
    ) -> Result<ExecutionOutcome, CoreError> {
        match self.kind() {
            InstanceKind::Workload => workload::run_standard(self, ctx, transition),
            InstanceKind::Network => network::run_standard(self, ctx, transition),
        }
    }

    pub fn run_operation(
        &mut self,
        ctx: ExecutionContext<'_>,
        name: &str,
        properties: &Properties,
    ) -> Result<ExecutionOutcome, CoreError> {
        match self.kind() {
            InstanceKind::Workload => workload::run_operation(self, ctx, name, properties),
            InstanceKind::Network => Ok(network::run_operation(self, name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn network_type() -> Arc<ResourceType> {
        Arc::new(ResourceType::builtin_network().unwrap())
    }

    #[test]
    fn new_instance_seeds_schema_properties() {
        let mut overrides = Properties::new();
        overrides.insert("networkname".to_owned(), json!("net1"));
        overrides.insert("extra".to_owned(), json!(7));
        let inst = ResourceInstance::new(ResourceId::new(3), network_type(), "net1", "local", overrides);

        assert_eq!(inst.properties["networkname"], json!("net1"));
        assert_eq!(inst.properties["subnet"], json!(""));
        assert_eq!(inst.properties["networkid"], json!(""));
        assert_eq!(inst.properties["extra"], json!(7));
        assert_eq!(inst.kind(), InstanceKind::Network);
        assert!(!inst.readonly);
        assert!(inst.internal_resource_instances().is_empty());
    }

    #[test]
    fn discovered_network_is_readonly_and_bound() {
        let info = NetworkInfo {
            id: "abc123".to_owned(),
            name: "bridge".to_owned(),
            driver: "bridge".to_owned(),
            subnet: Some("172.17.0.0/16".to_owned()),
            gateway: None,
        };
        let inst = ResourceInstance::discovered_network(ResourceId::new(1), network_type(), "local", &info);
        assert!(inst.readonly);
        assert_eq!(inst.property_str("networkid").as_deref(), Some("abc123"));
        assert_eq!(inst.property_str("gateway"), None);
        assert!(inst.is_network_named("local", "resource::docker-network::1.0", "bridge"));
        assert!(!inst.is_network_named("remote", "resource::docker-network::1.0", "bridge"));

        let details = inst.details("docker-rm");
        assert_eq!(details.resource_manager_id, "docker-rm");
        assert_eq!(details.internal_resource_instances.len(), 1);
        assert_eq!(details.internal_resource_instances[0].kind, "docker network");
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["resourceId"], json!(1));
        assert_eq!(value["internalResourceInstances"][0]["type"], json!("docker network"));
    }

    #[test]
    fn network_match_accepts_resource_name_or_property() {
        let mut overrides = Properties::new();
        overrides.insert("networkname".to_owned(), json!("backend-net"));
        let inst = ResourceInstance::new(ResourceId::new(4), network_type(), "custom", "local", overrides);
        assert!(inst.is_network_named("local", "resource::docker-network::1.0", "custom"));
        assert!(inst.is_network_named("local", "resource::docker-network::1.0", "backend-net"));
        assert!(!inst.is_network_named("local", "resource::docker-network::1.0", "other"));
    }
}
