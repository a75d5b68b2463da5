//! Events raised on parent resources
//!
//! A parent sees a start and an end event around every reconcile pass, one
//! warning per failed step and a few domain events: a missing cluster
//! configuration, and the outcome of a SKIPJob run. Publishing never fails a
//! reconcile; a rejected event is only logged.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

const RECONCILE: &str = "Reconcile";
const FINALIZE: &str = "Finalize";

/// Something worth telling the owner of a parent resource about
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParentEvent {
    /// A reconcile pass began
    ReconcileStarted {
        /// Parent kind, e.g. `Application`
        kind: String,
    },
    /// Every step of a reconcile pass synchronized
    ReconcileFinished {
        /// Parent kind
        kind: String,
    },
    /// A step failed with an error the user has to act on
    StepFailed {
        /// Step name, also the sub-status key
        step: String,
        /// The error message
        message: String,
    },
    /// Cleanup of a deleted parent is done
    Finalized,
    /// A cluster-level object a step depends on does not exist
    MissingConfiguration {
        /// What is missing
        message: String,
    },
    /// The SKIPJob's current run failed
    RunFailed {
        /// Name of the Job that ran
        job: String,
    },
    /// The SKIPJob's current run completed
    RunFinished {
        /// Name of the Job that ran
        job: String,
    },
}

impl ParentEvent {
    /// Warning for failures, Normal otherwise
    pub fn severity(&self) -> EventType {
        match self {
            Self::StepFailed { .. } | Self::MissingConfiguration { .. } | Self::RunFailed { .. } => {
                EventType::Warning
            }
            _ => EventType::Normal,
        }
    }

    /// Machine-readable reason, e.g. `DeploymentFailed`
    pub fn reason(&self) -> String {
        match self {
            Self::ReconcileStarted { .. } => "ReconcileStart".to_string(),
            Self::ReconcileFinished { .. } => "ReconcileEnd".to_string(),
            Self::StepFailed { step, .. } => format!("{step}Failed"),
            Self::Finalized => "Finalized".to_string(),
            Self::MissingConfiguration { .. } => "MissingConfiguration".to_string(),
            Self::RunFailed { .. } => "JobFailed".to_string(),
            Self::RunFinished { .. } => "JobFinished".to_string(),
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Self::Finalized => FINALIZE,
            _ => RECONCILE,
        }
    }

    fn note(&self) -> Option<String> {
        match self {
            Self::ReconcileStarted { kind } => Some(format!("{kind} reconciliation started")),
            Self::ReconcileFinished { kind } => Some(format!("{kind} has finished reconciling")),
            Self::StepFailed { message, .. } | Self::MissingConfiguration { message } => {
                Some(message.clone())
            }
            Self::Finalized => None,
            Self::RunFailed { job } => Some(format!("job {job} failed")),
            Self::RunFinished { job } => Some(format!("job {job} finished")),
        }
    }

    fn into_event(self) -> Event {
        Event {
            type_: self.severity(),
            reason: self.reason(),
            note: self.note(),
            action: self.action().to_string(),
            secondary: None,
        }
    }
}

/// Sink for [`ParentEvent`]s
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` against the parent `regarding` refers to
    async fn publish(&self, regarding: &ObjectReference, event: ParentEvent);
}

/// Writes events through the events.k8s.io API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`, with the pod name as instance when known
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, regarding: &ObjectReference, event: ParentEvent) {
        let reason = event.reason();
        if let Err(e) = self.recorder.publish(&event.into_event(), regarding).await {
            warn!(%reason, error = %e, "failed to publish event");
        }
    }
}

/// Drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _regarding: &ObjectReference, _event: ParentEvent) {}
}
