use crate::descriptor::{
    parse_descriptor_str, read_lifecycle_file, read_operations_file, ResourceDescriptor,
};
use crate::properties::{network_operation_schema, PropertySchema};
use crate::transition::StandardTransition;
use crate::types::TypeName;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Type name of the built-in container network resource.
pub const NETWORK_TYPE_NAME: &str = "resource::docker-network::1.0";

const NETWORK_KIND: &str = "docker-network";
const IMAGE_PREFIX: &str = "dockerrm_";
const DESCRIPTOR_FILE: &str = "resource.yaml";
const LIFECYCLE_FILE: &str = "lifecycle/lifecycle.yaml";
const OPERATIONS_FILE: &str = "operations/operations.yaml";

/// Directory names that never describe a resource type.
const RESERVED_DIRS: &[&str] = &["baseimage"];

/// Operations every resource type supports without declaring them.
const NETWORK_OPERATIONS: &[&str] = &["addNetwork", "removeNetwork"];

const NETWORK_DESCRIPTOR: &str = r"description: Bridge network managed by the resource manager
properties:
  networkname:
    type: string
    required: true
  subnet:
    type: string
    default: ''
  gateway:
    type: string
    default: ''
  networkid:
    type: string
    read-only: true
  bridgename:
    type: string
    read-only: true
lifecycle:
  - Install
  - Uninstall
";

/// A loaded resource type. Shared read-only by every instance of the type.
#[derive(Debug, Clone)]
pub struct ResourceType {
    pub name: TypeName,
    pub image_name: String,
    pub created_at: String,
    pub internal: bool,
    pub path: Option<PathBuf>,
    pub descriptor: ResourceDescriptor,
    pub descriptor_text: String,
    lifecycle_commands: BTreeMap<String, String>,
    operation_commands: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeOverview {
    pub name: String,
    pub state: String,
    pub created_at: String,
    pub last_modified_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDetails {
    pub name: String,
    pub state: String,
    pub created_at: String,
    pub last_modified_at: String,
    pub descriptor: String,
}

impl ResourceType {
    /// Load a type from its directory.
    ///
    /// The structural descriptor is optional. Lifecycle and operation command
    /// maps are only read for non-internal types.
    pub fn from_directory(path: &Path, internal: bool) -> Result<Self, SchemaError> {
        let kind = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SchemaError::InvalidTypeDir(path.display().to_string()))?;
        debug!("loading resource type {kind} from {}", path.display());

        let descriptor_path = path.join(DESCRIPTOR_FILE);
        let descriptor_text = if descriptor_path.is_file() {
            fs::read_to_string(&descriptor_path)?
        } else {
            debug!("no resource descriptor at {}", descriptor_path.display());
            String::new()
        };
        let descriptor = parse_descriptor_str(&descriptor_text)?;

        let (lifecycle_commands, operation_commands) = if internal {
            (BTreeMap::new(), BTreeMap::new())
        } else {
            let lifecycle_path = path.join(LIFECYCLE_FILE);
            let operations_path = path.join(OPERATIONS_FILE);
            let lifecycle = if lifecycle_path.is_file() {
                read_lifecycle_file(&lifecycle_path)?
            } else {
                BTreeMap::new()
            };
            let operations = if operations_path.is_file() {
                read_operations_file(&operations_path)?
            } else {
                BTreeMap::new()
            };
            (lifecycle, operations)
        };

        let created_at = fs::metadata(path)
            .and_then(|m| m.modified())
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
            .unwrap_or_else(|_| chrono::Utc::now().to_rfc3339());

        Ok(Self {
            name: TypeName::for_kind(kind),
            image_name: format!("{IMAGE_PREFIX}{kind}"),
            created_at,
            internal,
            path: Some(path.to_path_buf()),
            descriptor,
            descriptor_text,
            lifecycle_commands,
            operation_commands,
        })
    }

    /// The compiled-in container network type.
    pub fn builtin_network() -> Result<Self, SchemaError> {
        Ok(Self {
            name: TypeName::new(NETWORK_TYPE_NAME),
            image_name: format!("{IMAGE_PREFIX}{NETWORK_KIND}"),
            created_at: chrono::Utc::now().to_rfc3339(),
            internal: true,
            path: None,
            descriptor: parse_descriptor_str(NETWORK_DESCRIPTOR)?,
            descriptor_text: NETWORK_DESCRIPTOR.to_owned(),
            lifecycle_commands: BTreeMap::new(),
            operation_commands: BTreeMap::new(),
        })
    }

    pub fn is_network(&self) -> bool {
        self.name == *NETWORK_TYPE_NAME
    }

    pub fn properties(&self) -> &PropertySchema {
        &self.descriptor.properties
    }

    pub fn supports_transition(&self, transition: StandardTransition) -> bool {
        self.descriptor.lifecycle.supports(transition)
    }

    pub fn supports_operation(&self, name: &str) -> bool {
        NETWORK_OPERATIONS.contains(&name) || self.descriptor.operations.contains_key(name)
    }

    pub fn is_builtin_operation(name: &str) -> bool {
        NETWORK_OPERATIONS.contains(&name)
    }

    /// In-workload command for a standard transition: the lifecycle command
    /// file wins over a command declared inline in the descriptor.
    pub fn lifecycle_command(&self, transition: StandardTransition) -> Option<&str> {
        self.lifecycle_commands
            .get(transition.as_str())
            .map(String::as_str)
            .or_else(|| self.descriptor.lifecycle.command(transition))
    }

    /// Whether any standard transition has an in-workload command.
    pub fn has_lifecycle_commands(&self) -> bool {
        StandardTransition::ALL
            .into_iter()
            .any(|t| self.lifecycle_command(t).is_some())
    }

    pub fn operation_command(&self, name: &str) -> Option<&str> {
        self.operation_commands
            .get(name)
            .map(String::as_str)
            .or_else(|| {
                self.descriptor
                    .operations
                    .get(name)
                    .and_then(|op| op.command.as_deref())
            })
    }

    /// Property schema an operation request is validated against.
    pub fn operation_schema(&self, name: &str) -> Option<Cow<'_, PropertySchema>> {
        if Self::is_builtin_operation(name) {
            return Some(Cow::Owned(network_operation_schema()));
        }
        self.descriptor
            .operations
            .get(name)
            .map(|op| Cow::Borrowed(&op.properties))
    }

    pub fn overview(&self) -> TypeOverview {
        TypeOverview {
            name: self.name.to_string(),
            state: "PUBLISHED".to_owned(),
            created_at: self.created_at.clone(),
            last_modified_at: self.created_at.clone(),
        }
    }

    pub fn details(&self) -> TypeDetails {
        TypeDetails {
            name: self.name.to_string(),
            state: "PUBLISHED".to_owned(),
            created_at: self.created_at.clone(),
            last_modified_at: self.created_at.clone(),
            descriptor: self.descriptor_text.clone(),
        }
    }
}

/// Registry of loaded resource types, in load order.
///
/// A registry is never mutated once published; reloading builds a fresh one.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: Vec<Arc<ResourceType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding only the compiled-in types.
    pub fn with_builtins() -> Result<Self, SchemaError> {
        let mut registry = Self::new();
        registry.register(ResourceType::builtin_network()?);
        Ok(registry)
    }

    /// Add a type; returns `false` when the name is already registered.
    pub fn register(&mut self, resource_type: ResourceType) -> bool {
        if self.get(&resource_type.name).is_some() {
            debug!("resource type {} already registered", resource_type.name);
            return false;
        }
        self.types.push(Arc::new(resource_type));
        true
    }

    /// Load every type directory under `dir`, returning how many were added.
    ///
    /// Plain files, reserved names and already registered types are skipped;
    /// a directory whose descriptor cannot be read is logged and skipped.
    pub fn load_directory(&mut self, dir: &Path, internal: bool) -> Result<usize, SchemaError> {
        debug!("reading resource directory {}", dir.display());
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .collect();
        entries.sort();

        let mut added = 0;
        for path in entries {
            if !path.is_dir() {
                debug!("ignoring file {}", path.display());
                continue;
            }
            let Some(kind) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if RESERVED_DIRS.contains(&kind) {
                continue;
            }
            if self.get(TypeName::for_kind(kind).as_str()).is_some() {
                debug!("resource type {kind} already exists, not adding");
                continue;
            }
            match ResourceType::from_directory(&path, internal) {
                Ok(t) => {
                    if self.register(t) {
                        added += 1;
                    }
                }
                Err(e) => warn!("skipping resource type {kind}: {e}"),
            }
        }
        Ok(added)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResourceType>> {
        self.types.iter().find(|t| t.name == *name).cloned()
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<ResourceType>, SchemaError> {
        self.get(name)
            .ok_or_else(|| SchemaError::TypeNotFound(name.to_owned()))
    }

    pub fn overview_list(&self) -> Vec<TypeOverview> {
        self.types.iter().map(|t| t.overview()).collect()
    }

    pub fn details(&self, name: &str) -> Result<TypeDetails, SchemaError> {
        self.lookup(name).map(|t| t.details())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResourceType>> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
