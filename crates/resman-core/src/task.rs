use crate::events::{EventResourceInstance, InternalResourceInstance, LifecycleEvent};
use crate::instance::{ExecutionContext, ExecutionOutcome, InstanceKind, ResourceInstance};
use crate::instances::InstanceClaim;
use crate::lifecycle::finish_record;
use crate::manager::Shared;
use crate::transition::Transition;
use crate::CoreError;
use resman_schema::{Properties, StandardTransition};
use resman_store::{RequestState, TransitionRecord};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const FAILURE_PREFIX: &str = "Failure from Virtual Infrastructure";

/// The work a transition performs on its instance.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    Install,
    Configure,
    Start,
    Integrity,
    Stop,
    Uninstall,
    Operation { name: String, properties: Properties },
}

impl TaskKind {
    pub fn from_standard(transition: StandardTransition) -> Self {
        match transition {
            StandardTransition::Install => TaskKind::Install,
            StandardTransition::Configure => TaskKind::Configure,
            StandardTransition::Start => TaskKind::Start,
            StandardTransition::Integrity => TaskKind::Integrity,
            StandardTransition::Stop => TaskKind::Stop,
            StandardTransition::Uninstall => TaskKind::Uninstall,
        }
    }

    pub fn standard(&self) -> Option<StandardTransition> {
        match self {
            TaskKind::Install => Some(StandardTransition::Install),
            TaskKind::Configure => Some(StandardTransition::Configure),
            TaskKind::Start => Some(StandardTransition::Start),
            TaskKind::Integrity => Some(StandardTransition::Integrity),
            TaskKind::Stop => Some(StandardTransition::Stop),
            TaskKind::Uninstall => Some(StandardTransition::Uninstall),
            TaskKind::Operation { .. } => None,
        }
    }
}

/// A validated transition holding exclusive use of its instance.
pub struct TransitionTask {
    kind: TaskKind,
    claim: InstanceClaim,
}

impl TransitionTask {
    pub(crate) fn new(kind: TaskKind, claim: InstanceClaim) -> Self {
        Self { kind, claim }
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn resource_id(&self) -> resman_schema::ResourceId {
        self.claim.id()
    }

    /// Nothing to do: read-only networks never change, and an install of a
    /// network that already exists is satisfied by the existing one.
    fn short_circuits(&self, instance: &ResourceInstance) -> bool {
        if instance.kind() != InstanceKind::Network {
            return false;
        }
        match self.kind {
            TaskKind::Install => instance.readonly || instance.binding.is_some(),
            TaskKind::Uninstall => instance.readonly,
            _ => false,
        }
    }

    fn execute(&self, shared: &Shared, instance: &mut ResourceInstance) -> Result<ExecutionOutcome, CoreError> {
        let ctx = ExecutionContext {
            backend: shared.backend.as_ref(),
            publish_all_ports: shared.config.publish_all_ports,
        };
        match (&self.kind, self.kind.standard()) {
            (TaskKind::Operation { name, properties }, _) => {
                let _guard = shared.operation_lock.acquire()?;
                debug!("operation lock held for {name} on {}", instance.resource_id);
                instance.run_operation(ctx, name, properties)
            }
            (_, Some(transition)) => instance.run_standard_transition(ctx, transition),
            (_, None) => Ok(ExecutionOutcome::NoResult("nothing to run".to_owned())),
        }
    }

    /// Run to completion: execute, settle the instance, persist the terminal
    /// record, then publish the lifecycle event.
    pub(crate) fn run(self, shared: &Shared, transition: Transition) -> TransitionRecord {
        let Transition {
            record_id,
            mut record,
        } = transition;
        let request_id = record.request_id;

        let mut instance = match self.claim.snapshot() {
            Ok(instance) => instance,
            Err(e) => {
                error!("request {request_id}: {e}");
                return settle_record(shared, record_id, record, RequestState::Failed, Some(e.to_string()));
            }
        };
        info!(
            "request {request_id}: {} on resource {} ({})",
            record.transition_name, instance.resource_id, instance.name
        );

        let outcome = if self.short_circuits(&instance) {
            debug!("request {request_id}: nothing to do for {}", instance.name);
            Ok(ExecutionOutcome::Completed)
        } else {
            self.execute(shared, &mut instance)
        };

        let (state, reason, removed) = match outcome {
            Ok(ExecutionOutcome::Completed) => (RequestState::Completed, None, false),
            Ok(ExecutionOutcome::NoResult(why)) => {
                warn!("request {request_id}: {why}");
                (RequestState::Completed, None, false)
            }
            Ok(ExecutionOutcome::Removed) => (RequestState::Completed, None, true),
            Ok(ExecutionOutcome::Failed(why)) => (
                RequestState::Failed,
                Some(format!("{FAILURE_PREFIX}: {why}")),
                false,
            ),
            Err(e) => (
                RequestState::Failed,
                Some(format!("{FAILURE_PREFIX}: {e}")),
                false,
            ),
        };
        if let Some(reason) = &reason {
            warn!("request {request_id} failed: {reason}");
        }

        instance.touch();
        if let Err(e) = finish_record(&mut record, state, reason) {
            error!("request {request_id}: {e}");
        }
        let is_install = self.kind == TaskKind::Install;
        if is_install && instance.installed_at.is_none() {
            instance.installed_at.clone_from(&record.finished_at);
        }
        let discard = removed || (state == RequestState::Failed && is_install && self.claim.created());
        let Self { claim, .. } = self;
        let settled = if discard {
            claim.remove().map(|_| ())
        } else {
            let committed = claim.commit(instance.clone());
            drop(claim);
            committed
        };
        if let Err(e) = settled {
            warn!("request {request_id}: failed to update instance {}: {e}", instance.resource_id);
        }

        if record.resource_id.is_none() {
            record.resource_id = Some(instance.resource_id.to_string());
        }
        persist_record(shared, record_id, &record);
        publish_event(shared, &record, &instance);
        record
    }
}

fn settle_record(
    shared: &Shared,
    record_id: resman_store::RecordId,
    mut record: TransitionRecord,
    state: RequestState,
    reason: Option<String>,
) -> TransitionRecord {
    if let Err(e) = finish_record(&mut record, state, reason) {
        error!("request {}: {e}", record.request_id);
    }
    persist_record(shared, record_id, &record);
    record
}

fn persist_record(shared: &Shared, record_id: resman_store::RecordId, record: &TransitionRecord) {
    if let Err(e) = shared.records.update(record_id, record) {
        error!("request {}: failed to persist status: {e}", record.request_id);
    }
}

fn build_event(shared: &Shared, record: &TransitionRecord, instance: &ResourceInstance) -> LifecycleEvent {
    let internal_id = match instance.kind() {
        InstanceKind::Network => instance.property_str("networkid"),
        InstanceKind::Workload => instance.binding.as_ref().map(|b| b.id().to_owned()),
    };
    LifecycleEvent {
        request_id: record.request_id,
        transition_name: record.transition_name.clone(),
        request_state: record.request_state,
        request_state_reason: record.request_state_reason.clone(),
        started_at: record.started_at.clone(),
        finished_at: record.finished_at.clone(),
        resource_id: record.resource_id.clone(),
        resource_manager_id: record.resource_manager_id.clone(),
        deployment_location: record.deployment_location.clone(),
        metric_key: record.metric_key.clone(),
        context: shared.response_context(),
        resource_instance: EventResourceInstance {
            resource_id: instance.resource_id,
            resource_name: instance.name.clone(),
            resource_type: instance.type_name().to_owned(),
            metric_key: record.metric_key.clone(),
            resource_manager_id: record
                .resource_manager_id
                .clone()
                .unwrap_or_else(|| shared.config.name.clone()),
            deployment_location: instance.location.clone(),
            properties: instance.properties.clone(),
            created_at: instance.installed_at.clone(),
            last_modified_at: instance.last_modified_at.clone(),
            internal_resource_instances: vec![InternalResourceInstance {
                id: internal_id,
                name: instance.name.clone(),
                kind: instance.resource_type.name.normalized(),
            }],
        },
    }
}

fn publish_event(shared: &Shared, record: &TransitionRecord, instance: &ResourceInstance) {
    let event = build_event(shared, record, instance);
    if let Err(e) = shared.publisher.publish(&event) {
        warn!("request {}: failed to publish lifecycle event: {e}", record.request_id);
    }
}

/// Handle on a transition running in the background.
#[derive(Debug)]
pub struct TaskHandle {
    request_id: u64,
    receiver: Receiver<TransitionRecord>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TaskHandle {
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        task: TransitionTask,
        transition: Transition,
    ) -> Result<Self, CoreError> {
        let request_id = transition.record.request_id;
        let (sender, receiver) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(format!("transition-{request_id}"))
            .spawn(move || {
                let record = task.run(&shared, transition);
                let _ = sender.send(record);
            })?;
        Ok(Self {
            request_id,
            receiver,
            thread: Some(thread),
        })
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        match &self.thread {
            Some(thread) => thread.is_finished(),
            None => true,
        }
    }

    /// Block until the transition reaches its terminal state.
    pub fn wait(mut self) -> Result<TransitionRecord, CoreError> {
        let record = self.receiver.recv().map_err(|_| {
            CoreError::Lock(format!("transition {} ended without a status", self.request_id))
        })?;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(record)
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TransitionRecord> {
        match self.receiver.recv_timeout(timeout) {
            Ok(record) => Some(record),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}
