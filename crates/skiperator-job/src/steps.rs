//! Reconcile steps specific to SKIPJob

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use skiperator_common::crd::SkipJob;
use skiperator_common::{ParentEvent, Result, SkiperatorStatus};
use skiperator_reconcile::ownership::{is_owned_by, tag};
use skiperator_reconcile::{ReconcileStep, StepOutcome};
use skiperator_workload::{ParentIdentity, StepContext};
use tracing::{debug, info, warn};

use crate::compiler::{
    desired_workload, keep_generated_selector, recorded_template_hash, run_selector, Workload,
};
use crate::lifecycle::{track, RunState, STARTING_REQUEUE};

/// What to do with the one-off Job of a SKIPJob
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunAction {
    /// Create the Job, or bring its mutable fields up to date
    Sync,
    /// The run for this generation has concluded and its Job is gone
    Hold,
    /// The pod template changed; delete the Job so a new run can start
    Replace,
}

/// Decide how to treat the one-off Job.
///
/// A Job's pod template is immutable, so a changed template means a new run.
/// A concluded run whose Job was garbage collected is not started again
/// until the parent's generation moves past the one the run was created for.
pub fn run_action(
    current: Option<&Job>,
    desired: &Job,
    status: &SkiperatorStatus,
    generation: Option<i64>,
) -> RunAction {
    match current {
        None => {
            let concluded = RunState::from_status(status).is_terminal();
            if concluded && status.run_generation.is_some() && status.run_generation == generation {
                RunAction::Hold
            } else {
                RunAction::Sync
            }
        }
        Some(current) => match (recorded_template_hash(current), recorded_template_hash(desired)) {
            (Some(have), Some(want)) if have != want => RunAction::Replace,
            _ => RunAction::Sync,
        },
    }
}

/// Writes the Job or CronJob and removes the other kind when the schedule
/// is added or dropped
pub struct JobStep {
    ctx: Arc<StepContext>,
}

impl JobStep {
    /// Create the step
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ReconcileStep<SkipJob> for JobStep {
    fn name(&self) -> &'static str {
        "Job"
    }

    async fn reconcile(&self, job: &SkipJob, status: &mut SkiperatorStatus) -> Result<StepOutcome> {
        let id = ParentIdentity::of(job)?;
        let sync = &self.ctx.sync;
        match desired_workload(job, &self.ctx.config)? {
            Workload::Job(mut batch) => {
                if sync.delete_owned::<CronJob>(&id.namespace, &id.name, &id.uid).await? {
                    info!(skipjob = %id.name, "schedule removed, deleted CronJob");
                }
                tag(job, &mut batch)?;
                let current: Option<Job> = sync.get(&id.namespace, &id.name).await?;
                let generation = job.metadata.generation;
                match run_action(current.as_ref(), &batch, status, generation) {
                    RunAction::Hold => {
                        debug!(skipjob = %id.name, "run already concluded for this generation");
                    }
                    RunAction::Replace => {
                        info!(skipjob = %id.name, "pod template changed, replacing Job");
                        sync.delete::<Job>(&id.namespace, &id.name).await?;
                        return Ok(StepOutcome::RequeueAfter(STARTING_REQUEUE));
                    }
                    RunAction::Sync => {
                        sync.sync_with(batch, keep_generated_selector).await?;
                        status.run_generation = generation;
                    }
                }
            }
            Workload::CronJob(mut cron) => {
                status.run_generation = None;
                tag(job, &mut cron)?;
                sync.sync(cron).await?;
                if sync.delete_owned::<Job>(&id.namespace, &id.name, &id.uid).await? {
                    info!(skipjob = %id.name, "schedule added, deleted one-off Job");
                }
            }
        }
        Ok(StepOutcome::Synced)
    }
}

/// Tracks the newest run and records its state as conditions
pub struct JobLifecycleStep {
    ctx: Arc<StepContext>,
}

impl JobLifecycleStep {
    /// Create the step
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self { ctx }
    }
}

fn run_name(run: Option<&Job>) -> String {
    run.map(|r| r.name_any()).unwrap_or_default()
}

/// The most recently created Job
pub fn newest(jobs: Vec<Job>) -> Option<Job> {
    jobs.into_iter()
        .max_by_key(|j| j.metadata.creation_timestamp.clone())
}

#[async_trait]
impl ReconcileStep<SkipJob> for JobLifecycleStep {
    fn name(&self) -> &'static str {
        "JobLifecycle"
    }

    async fn reconcile(&self, job: &SkipJob, status: &mut SkiperatorStatus) -> Result<StepOutcome> {
        let id = ParentIdentity::of(job)?;
        let selector = run_selector(&id.name);
        let sync = &self.ctx.sync;

        let run = newest(sync.list::<Job>(&id.namespace, Some(&selector)).await?);
        let pods: Vec<Pod> = match run.as_ref().and_then(|r| r.uid()) {
            Some(run_uid) => sync
                .list::<Pod>(&id.namespace, Some(&selector))
                .await?
                .into_iter()
                .filter(|p| is_owned_by(p, &run_uid))
                .collect(),
            None => Vec::new(),
        };

        let tracked = track(status, run.as_ref(), &pods, &id.name);
        let obj_ref = job.object_ref(&());
        match tracked.entered {
            Some(RunState::Failed) => {
                warn!(skipjob = %id.name, run = ?status.current_run, "run failed");
                self.ctx
                    .events
                    .publish(&obj_ref, ParentEvent::RunFailed { job: run_name(run.as_ref()) })
                    .await;
            }
            Some(RunState::Finished) => {
                info!(skipjob = %id.name, run = ?status.current_run, "run finished");
                self.ctx
                    .events
                    .publish(&obj_ref, ParentEvent::RunFinished { job: run_name(run.as_ref()) })
                    .await;
            }
            Some(state) => debug!(skipjob = %id.name, ?state, "run state changed"),
            None => {}
        }
        Ok(tracked.outcome)
    }
}
