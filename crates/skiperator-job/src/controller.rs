//! SKIPJob controller

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use skiperator_common::crd::SkipJob;
use skiperator_common::{Error, EventPublisher, Result};
use skiperator_reconcile::{retry_after, Orchestrator, ParentStore};
use skiperator_workload::{
    GcpAuthConfigMapStep, NetworkPolicyStep, OwnedObjectStep, ServiceAccountStep,
    ServiceEntryStep, StepContext,
};
use tracing::{error, info, instrument};

use crate::compiler::desired_pod_monitor;
use crate::steps::{JobLifecycleStep, JobStep};

/// The SKIPJob pipeline, in execution order
pub fn orchestrator(
    store: Arc<dyn ParentStore<SkipJob>>,
    events: Arc<dyn EventPublisher>,
    ctx: Arc<StepContext>,
) -> Orchestrator<SkipJob> {
    Orchestrator::new(store, events)
        .with_step(ServiceAccountStep::new(ctx.clone()))
        .with_step(GcpAuthConfigMapStep::new(ctx.clone()))
        .with_step(NetworkPolicyStep::new(ctx.clone()))
        .with_step(ServiceEntryStep::new(ctx.clone()))
        .with_step(JobStep::new(ctx.clone()))
        .with_step(OwnedObjectStep::new("PodMonitor", ctx.clone(), |job, _| {
            desired_pod_monitor(job)
        }))
        .with_step(JobLifecycleStep::new(ctx))
}

/// Shared context for the SKIPJob controller
pub struct SkipJobContext {
    /// The step pipeline
    pub orchestrator: Orchestrator<SkipJob>,
}

impl SkipJobContext {
    /// Create a context around a pipeline
    pub fn new(orchestrator: Orchestrator<SkipJob>) -> Self {
        Self { orchestrator }
    }
}

/// Reconcile a SKIPJob
#[instrument(skip(job, ctx), fields(skipjob = %job.name_any(), namespace = ?job.namespace()))]
pub async fn reconcile(job: Arc<SkipJob>, ctx: Arc<SkipJobContext>) -> Result<Action> {
    info!("reconciling skipjob");
    ctx.orchestrator.reconcile(&job).await
}

/// Requeue a failed SKIPJob
pub fn error_policy(job: Arc<SkipJob>, error: &Error, _ctx: Arc<SkipJobContext>) -> Action {
    error!(
        ?error,
        skipjob = %job.name_any(),
        retryable = error.is_retryable(),
        "skipjob reconciliation failed"
    );
    Action::requeue(retry_after(error))
}
