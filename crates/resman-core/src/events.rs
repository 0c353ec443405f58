use crate::transition::ResponseContext;
use crate::CoreError;
use resman_schema::{Properties, ResourceId};
use resman_store::RequestState;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use tracing::debug;

/// A backend object behind a resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalResourceInstance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResourceInstance {
    pub resource_id: ResourceId,
    pub resource_name: String,
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_key: Option<String>,
    pub resource_manager_id: String,
    pub deployment_location: String,
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    pub last_modified_at: String,
    pub internal_resource_instances: Vec<InternalResourceInstance>,
}

/// Published once per transition, after its terminal status is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub request_id: u64,
    pub transition_name: String,
    pub request_state: RequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_state_reason: Option<String>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_manager_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_key: Option<String>,
    pub context: ResponseContext,
    pub resource_instance: EventResourceInstance,
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &LifecycleEvent) -> Result<(), CoreError>;
}

/// Discards events; used when asynchronous responses are disabled.
#[derive(Debug, Default)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, event: &LifecycleEvent) -> Result<(), CoreError> {
        debug!("not publishing event for request {}", event.request_id);
        Ok(())
    }
}

/// POSTs each event as JSON to `<url>/<topic>`.
pub struct HttpPublisher {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpPublisher {
    pub fn new(url: &str, topic: &str) -> Self {
        let agent = ureq::Agent::new_with_defaults();
        Self {
            endpoint: format!("{}/{topic}", url.trim_end_matches('/')),
            agent,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl EventPublisher for HttpPublisher {
    fn publish(&self, event: &LifecycleEvent) -> Result<(), CoreError> {
        let body = serde_json::to_vec(event)?;
        debug!("POST {} for request {}", self.endpoint, event.request_id);
        self.agent
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .send(&body[..])
            .map_err(|e| CoreError::Event(e.to_string()))?;
        Ok(())
    }
}

/// Delivers events to an in-process receiver.
pub struct ChannelPublisher {
    sender: Mutex<Sender<LifecycleEvent>>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, Receiver<LifecycleEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, event: &LifecycleEvent) -> Result<(), CoreError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| CoreError::Lock("event channel mutex poisoned".to_owned()))?;
        sender
            .send(event.clone())
            .map_err(|_| CoreError::Event("event receiver dropped".to_owned()))
    }
}
