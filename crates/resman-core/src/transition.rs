use crate::instance::ResourceInstance;
use crate::instances::InstanceClaim;
use crate::manager::Shared;
use crate::task::{TaskKind, TransitionTask};
use crate::CoreError;
use resman_schema::{validate_properties, Properties, ResourceId, ResourceType, StandardTransition};
use resman_store::{RecordId, RequestState, TransitionRecord};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// An inbound transition request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRequest {
    #[serde(default)]
    pub transition_name: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub resource_name: Option<String>,
    #[serde(default)]
    pub deployment_location: Option<String>,
    #[serde(default)]
    pub properties: Option<Properties>,
    #[serde(default)]
    pub metric_key: Option<String>,
    #[serde(default)]
    pub resource_manager_id: Option<String>,
}

/// Resource ids arrive as strings or numbers.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "resourceId must be a string or number, got {other}"
        ))),
    }
}

impl TransitionRequest {
    pub fn new(transition_name: &str) -> Self {
        Self {
            transition_name: Some(transition_name.to_owned()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_resource_id(mut self, id: impl ToString) -> Self {
        self.resource_id = Some(id.to_string());
        self
    }

    #[must_use]
    pub fn with_type(mut self, resource_type: &str) -> Self {
        self.resource_type = Some(resource_type.to_owned());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.resource_name = Some(name.to_owned());
        self
    }

    #[must_use]
    pub fn with_location(mut self, location: &str) -> Self {
        self.deployment_location = Some(location.to_owned());
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties
            .get_or_insert_with(Properties::new)
            .insert(key.to_owned(), value.into());
        self
    }

    #[must_use]
    pub fn with_metric_key(mut self, key: &str) -> Self {
        self.metric_key = Some(key.to_owned());
        self
    }

    #[must_use]
    pub fn with_resource_manager_id(mut self, id: &str) -> Self {
        self.resource_manager_id = Some(id.to_owned());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseContext {
    #[serde(rename = "AsynchronousTransitionResponses")]
    pub asynchronous_transition_responses: bool,
}

impl Default for ResponseContext {
    fn default() -> Self {
        Self {
            asynchronous_transition_responses: true,
        }
    }
}

/// Immediate reply to an accepted transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionResponse {
    pub request_id: u64,
    pub request_state: RequestState,
    pub context: ResponseContext,
}

/// Full persisted state of a transition request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionStatus {
    #[serde(flatten)]
    pub record: TransitionRecord,
    pub context: ResponseContext,
}

/// Condensed state of a transition request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    pub request_id: u64,
    pub request_state: RequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_state_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub context: ResponseContext,
}

impl TransitionStatus {
    pub fn new(mut record: TransitionRecord, context: ResponseContext) -> Self {
        record.checksum = None;
        Self { record, context }
    }

    pub fn summary(&self) -> RequestStatus {
        RequestStatus {
            request_id: self.record.request_id,
            request_state: self.record.request_state,
            request_state_reason: self.record.request_state_reason.clone(),
            resource_id: self.record.resource_id.clone(),
            started_at: self.record.started_at.clone(),
            finished_at: self.record.finished_at.clone(),
            context: self.context,
        }
    }
}

/// An accepted transition: its persisted record and where it lives.
#[derive(Debug, Clone)]
pub struct Transition {
    pub record_id: RecordId,
    pub record: TransitionRecord,
}

impl Transition {
    /// Persist an IN_PROGRESS record for `request`, then validate it. A
    /// request that fails validation leaves no record behind.
    pub(crate) fn prepare(
        shared: &Shared,
        request_id: u64,
        request: TransitionRequest,
    ) -> Result<(Self, TransitionTask), CoreError> {
        let mut record = TransitionRecord::new(
            request_id,
            request.transition_name.clone().unwrap_or_default(),
        );
        record.resource_id.clone_from(&request.resource_id);
        record.resource_type.clone_from(&request.resource_type);
        record.resource_name.clone_from(&request.resource_name);
        record.deployment_location.clone_from(&request.deployment_location);
        record.properties = request.properties.clone().unwrap_or_default();
        record.metric_key.clone_from(&request.metric_key);
        record.resource_manager_id.clone_from(&request.resource_manager_id);
        let record_id = shared.records.create(&record)?;

        match validate(shared, request, &mut record) {
            Ok(task) => Ok((Self { record_id, record }, task)),
            Err(e) => {
                debug!("request {request_id} rejected: {e}");
                if let Err(re) = shared.records.remove(record_id) {
                    warn!("failed to discard record of rejected request {request_id}: {re}");
                }
                Err(e)
            }
        }
    }
}

fn validate(
    shared: &Shared,
    request: TransitionRequest,
    record: &mut TransitionRecord,
) -> Result<TransitionTask, CoreError> {
    let name = request
        .transition_name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| CoreError::InvalidTransition("no transition name in request".to_owned()))?;

    match request.resource_id.clone() {
        Some(id) => validate_existing(shared, &name, &id, request),
        None => validate_install(shared, &name, request, record),
    }
}

/// A transition on an instance that already exists.
fn validate_existing(
    shared: &Shared,
    name: &str,
    id: &str,
    request: TransitionRequest,
) -> Result<TransitionTask, CoreError> {
    let resource_id: ResourceId = id
        .parse()
        .map_err(|_| CoreError::InstanceNotFound(id.to_owned()))?;
    let instance = shared
        .instances
        .get(resource_id)?
        .ok_or_else(|| CoreError::InstanceNotFound(id.to_owned()))?;

    let kind = match StandardTransition::parse(name) {
        Some(StandardTransition::Install) => {
            return Err(CoreError::InvalidTransition(format!(
                "Install requested on existing resource {id}"
            )));
        }
        Some(standard) => {
            if !instance.resource_type.supports_transition(standard) {
                return Err(CoreError::InvalidTransition(format!(
                    "{name} is not supported by {}",
                    instance.type_name()
                )));
            }
            TaskKind::from_standard(standard)
        }
        None => {
            if !instance.resource_type.supports_operation(name) {
                return Err(CoreError::InvalidTransition(format!(
                    "{name} is not an operation of {}",
                    instance.type_name()
                )));
            }
            let mut properties = request.properties.unwrap_or_default();
            if let Some(schema) = instance.resource_type.operation_schema(name) {
                validate_properties(&schema, &mut properties)?;
            }
            TaskKind::Operation {
                name: name.to_owned(),
                properties,
            }
        }
    };

    let claim = shared.instances.claim(resource_id)?;
    Ok(TransitionTask::new(kind, claim))
}

/// A fresh install; creates (or, for networks, finds) the instance.
fn validate_install(
    shared: &Shared,
    name: &str,
    request: TransitionRequest,
    record: &mut TransitionRecord,
) -> Result<TransitionTask, CoreError> {
    let type_name = request
        .resource_type
        .as_deref()
        .ok_or(CoreError::TypeMissingFromRequest)?;
    let resource_type = shared.registry()?.lookup(type_name)?;

    if StandardTransition::parse(name) != Some(StandardTransition::Install)
        || !resource_type.supports_transition(StandardTransition::Install)
    {
        return Err(CoreError::InvalidTransition(format!(
            "{name} on {type_name} requires an existing resource id"
        )));
    }

    let location = match request.deployment_location.as_deref() {
        Some(location) => shared
            .config
            .location(location)
            .ok_or_else(|| CoreError::UnknownLocationInRequest(location.to_owned()))?,
        None if resource_type.is_network() => shared
            .config
            .first_location()
            .ok_or(CoreError::NoLocationInRequest)?,
        None => return Err(CoreError::NoLocationInRequest),
    }
    .name
    .clone();
    record.deployment_location = Some(location.clone());

    let mut properties = request.properties.unwrap_or_default();
    validate_properties(resource_type.properties(), &mut properties)?;
    if let Some(metric_key) = &request.metric_key {
        properties.insert("metricKey".to_owned(), Value::String(metric_key.clone()));
    }
    record.properties.clone_from(&properties);

    let claim = create_instance(
        shared,
        &resource_type,
        &location,
        request.resource_name.as_deref(),
        properties,
    )?;
    Ok(TransitionTask::new(TaskKind::Install, claim))
}

fn create_instance(
    shared: &Shared,
    resource_type: &Arc<ResourceType>,
    location: &str,
    resource_name: Option<&str>,
    properties: Properties,
) -> Result<InstanceClaim, CoreError> {
    if resource_type.is_network() {
        let networkname = properties
            .get("networkname")
            .map(resman_schema::display_value)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| CoreError::MissingProperty("networkname".to_owned()))?;
        let name = resource_name.unwrap_or(&networkname).to_owned();
        let type_name = resource_type.name.as_str().to_owned();
        let resource_type = Arc::clone(resource_type);
        let location_name = location.to_owned();
        shared.instances.find_or_create_network(
            location,
            &type_name,
            &networkname,
            move |id| ResourceInstance::new(id, resource_type, &name, &location_name, properties),
        )
    } else {
        let resource_type = Arc::clone(resource_type);
        let name = resource_name.unwrap_or_default().to_owned();
        shared.instances.create_claimed(move |id| {
            ResourceInstance::new(id, resource_type, &name, location, properties)
        })
    }
}
