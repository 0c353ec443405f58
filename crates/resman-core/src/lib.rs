//! Transition engine for resman.
//!
//! This crate ties the type registry, the record store and a compute backend
//! together into the `ResourceManager`: it validates inbound transition
//! requests, owns the in-memory arena of resource instances, runs each
//! accepted transition as an asynchronous task against a workload container
//! or network, persists the request status and publishes completion events.

pub mod concurrency;
pub mod config;
pub mod events;
pub mod instance;
pub mod instances;
pub mod lifecycle;
pub mod manager;
pub mod network;
pub mod task;
pub mod transition;
pub mod workload;

pub use concurrency::{install_signal_handler, shutdown_requested, OperationLock, StoreLock};
pub use config::{EventsConfig, Features, Location, ManagerConfig, PersistenceConfig};
pub use events::{
    ChannelPublisher, EventPublisher, EventResourceInstance, HttpPublisher,
    InternalResourceInstance, LifecycleEvent, NoopPublisher,
};
pub use instance::{
    BackendBinding, ExecutionContext, ExecutionOutcome, InstanceDetails, InstanceKind,
    ResourceInstance,
};
pub use instances::{InstanceClaim, InstanceStore};
pub use lifecycle::{finish_record, validate_request_transition};
pub use manager::{ManagerInfo, ResourceManager};
pub use task::{TaskHandle, TaskKind, TransitionTask};
pub use transition::{
    RequestStatus, ResponseContext, Transition, TransitionRequest, TransitionResponse,
    TransitionStatus,
};

use resman_schema::SchemaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("resource type not found: {0}")]
    TypeNotFound(String),
    #[error("no resource type in transition request")]
    TypeMissingFromRequest,
    #[error("resource instance not found: {0}")]
    InstanceNotFound(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("no deployment location in transition request")]
    NoLocationInRequest,
    #[error("unknown deployment location: {0}")]
    UnknownLocationInRequest(String),
    #[error("missing mandatory property: {0}")]
    MissingProperty(String),
    #[error("resource busy: {0}")]
    ResourceBusy(String),
    #[error("transition request not found: {0}")]
    TransitionNotFound(u64),
    #[error("persistence failure: {0}")]
    Persistence(#[from] resman_store::StoreError),
    #[error("no image found: {0}")]
    NoImageFound(String),
    #[error("no container found for resource instance {0}")]
    NoContainerFound(String),
    #[error("runtime error: {0}")]
    Runtime(#[from] resman_runtime::RuntimeError),
    #[error("resource descriptor error: {0}")]
    Schema(SchemaError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("params file error: {0}")]
    Params(#[from] serde_yaml::Error),
    #[error("event publishing failed: {0}")]
    Event(String),
    #[error("lock error: {0}")]
    Lock(String),
}

impl From<SchemaError> for CoreError {
    fn from(e: SchemaError) -> Self {
        match e {
            SchemaError::MissingProperty(name) => CoreError::MissingProperty(name),
            SchemaError::TypeNotFound(name) => CoreError::TypeNotFound(name),
            other => CoreError::Schema(other),
        }
    }
}
