//! Resource type schema layer for resman.
//!
//! This crate defines what a manageable resource *is*: YAML resource
//! descriptors (`ResourceDescriptor`), ordered property schemas and the
//! property validator (`validate_properties`), the six standard lifecycle
//! transitions (`StandardTransition`), and the `TypeRegistry` that loads
//! resource types from directories.

pub mod descriptor;
pub mod properties;
pub mod registry;
pub mod transition;
pub mod types;

pub use descriptor::{
    parse_descriptor_file, parse_descriptor_str, LifecycleDecl, OperationDecl, ResourceDescriptor,
};
pub use properties::{
    display_value, network_operation_schema, seed_properties, validate_properties, Properties,
    PropertySchema, PropertySpec,
};
pub use registry::{ResourceType, TypeDetails, TypeOverview, TypeRegistry, NETWORK_TYPE_NAME};
pub use transition::StandardTransition;
pub use types::{ResourceId, TypeName};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read resource descriptor: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse descriptor: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
    #[error("missing mandatory property: {0}")]
    MissingProperty(String),
    #[error("type not found: {0}")]
    TypeNotFound(String),
    #[error("invalid resource type directory: {0}")]
    InvalidTypeDir(String),
}
