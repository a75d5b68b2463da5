//! Run lifecycle of a SKIPJob
//!
//! A run is one batch/v1 Job. Its state moves `Pending -> Running ->
//! {Finished, Failed}` and is stored as three conditions on the parent, with
//! the Job's UID in `status.currentRun`. When the CronJob spawns a new Job the
//! UID changes and tracking starts over at `Pending`.
//!
//! Exit codes are read from the workload container, but only once the
//! `istio-proxy` sidecar has terminated too. A workload container that exits
//! while the proxy is still draining has not finished its run yet.

use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ContainerStateTerminated, ContainerStatus, Pod};
use kube::ResourceExt;
use skiperator_common::crd::{Condition, ConditionStatus};
use skiperator_common::mesh::SIDECAR_CONTAINER;
use skiperator_common::SkiperatorStatus;
use skiperator_reconcile::StepOutcome;

/// Condition type set while the run is in progress
pub const RUNNING: &str = "Running";
/// Condition type set when the run succeeded
pub const FINISHED: &str = "Finished";
/// Condition type set when the run failed
pub const FAILED: &str = "Failed";

/// Requeue while the Job exists but has no pods yet
pub const STARTING_REQUEUE: Duration = Duration::from_secs(5);
/// Requeue while pods are running
pub const RUNNING_REQUEUE: Duration = Duration::from_secs(15);

/// State of the current run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// No Job has been observed for this run
    Pending,
    /// The Job exists and has not concluded
    Running,
    /// The workload exited successfully
    Finished,
    /// The workload or the Job failed
    Failed,
}

impl RunState {
    /// Read the state back from the parent's conditions
    pub fn from_status(status: &SkiperatorStatus) -> Self {
        if status.condition_is_true(FAILED) {
            Self::Failed
        } else if status.condition_is_true(FINISHED) {
            Self::Finished
        } else if status.condition_is_true(RUNNING) {
            Self::Running
        } else {
            Self::Pending
        }
    }

    /// Finished or Failed
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// What the cluster says about a run that has not concluded yet
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    /// Job exists but no pod has been scheduled
    Starting,
    /// Pods are running
    Running,
    /// Run succeeded
    Succeeded(String),
    /// Run failed
    Failed(String),
}

/// Result of one tracking pass
#[derive(Clone, Debug, PartialEq)]
pub struct Tracked {
    /// What the step should return
    pub outcome: StepOutcome,
    /// The state entered during this pass, if it changed
    pub entered: Option<RunState>,
}

fn job_condition_is_true(job: &Job, type_: &str) -> Option<String> {
    job.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_ && c.status == "True")
        .map(|c| c.message.clone().unwrap_or_else(|| type_.to_string()))
}

fn terminated(s: &ContainerStatus) -> Option<&ContainerStateTerminated> {
    s.state.as_ref()?.terminated.as_ref()
}

/// Exit code of the workload container, once it and the sidecar have stopped.
///
/// The sidecar is either a regular container or, with native sidecars, an
/// init container that keeps running next to the workload.
fn workload_exit_code(pod: &Pod, container: &str) -> Option<i32> {
    let status = pod.status.as_ref()?;
    let containers = status.container_statuses.as_deref().unwrap_or_default();
    let init_containers = status.init_container_statuses.as_deref().unwrap_or_default();
    let sidecar = containers
        .iter()
        .chain(init_containers)
        .find(|s| s.name == SIDECAR_CONTAINER);
    if sidecar.is_some_and(|s| terminated(s).is_none()) {
        return None;
    }
    containers
        .iter()
        .find(|s| s.name == container)
        .and_then(terminated)
        .map(|t| t.exit_code)
}

/// Classify a run from its Job and pods. Failures take precedence.
pub fn observe(job: &Job, pods: &[Pod], container: &str) -> Observation {
    if let Some(message) = job_condition_is_true(job, "Failed") {
        return Observation::Failed(message);
    }
    if let Some(pod) = pods
        .iter()
        .find(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Failed"))
    {
        return Observation::Failed(format!("pod {} failed", pod.name_any()));
    }

    let exit_codes: Vec<(String, i32)> = pods
        .iter()
        .filter_map(|p| workload_exit_code(p, container).map(|code| (p.name_any(), code)))
        .collect();
    if let Some((pod, code)) = exit_codes.iter().find(|(_, code)| *code != 0) {
        return Observation::Failed(format!("container {container} in pod {pod} exited with code {code}"));
    }
    if !exit_codes.is_empty() {
        return Observation::Succeeded(format!("container {container} exited successfully"));
    }
    if let Some(message) = job_condition_is_true(job, "Complete") {
        return Observation::Succeeded(message);
    }

    if pods.is_empty() {
        Observation::Starting
    } else {
        Observation::Running
    }
}

fn set_state(status: &mut SkiperatorStatus, state: RunState, reason: &str, message: &str) {
    for (type_, active) in [
        (RUNNING, state == RunState::Running),
        (FINISHED, state == RunState::Finished),
        (FAILED, state == RunState::Failed),
    ] {
        status.set_condition(Condition::new(type_, ConditionStatus::from(active), reason, message));
    }
}

/// Advance the run state stored in `status`.
///
/// `job` is the newest batch Job of the parent, `pods` its pods.
pub fn track(
    status: &mut SkiperatorStatus,
    job: Option<&Job>,
    pods: &[Pod],
    container: &str,
) -> Tracked {
    let Some(job) = job else {
        return Tracked {
            outcome: StepOutcome::Synced,
            entered: None,
        };
    };

    let uid = job.uid();
    let mut entered = None;
    if status.current_run != uid {
        status.current_run = uid;
        set_state(status, RunState::Pending, "NewRun", "waiting for the job to start");
        entered = Some(RunState::Pending);
    }

    let current = RunState::from_status(status);
    if current.is_terminal() {
        return Tracked {
            outcome: StepOutcome::Synced,
            entered,
        };
    }

    let (next, reason, message, outcome) = match observe(job, pods, container) {
        Observation::Starting => (
            RunState::Running,
            "JobStarted",
            "waiting for pods".to_string(),
            StepOutcome::RequeueAfter(STARTING_REQUEUE),
        ),
        Observation::Running => (
            RunState::Running,
            "JobRunning",
            "pods are running".to_string(),
            StepOutcome::RequeueAfter(RUNNING_REQUEUE),
        ),
        Observation::Succeeded(message) => (RunState::Finished, "JobFinished", message, StepOutcome::Synced),
        Observation::Failed(message) => (RunState::Failed, "JobFailed", message, StepOutcome::Synced),
    };

    if next != current {
        entered = Some(next);
    }
    set_state(status, next, reason, &message);
    Tracked { outcome, entered }
}
