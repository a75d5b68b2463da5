//! SKIPJob controller for Skiperator
//!
//! A SKIPJob runs one container to completion, either once as a batch Job or
//! on a schedule as a CronJob. Besides the shared workload objects it tracks
//! the state of the newest run on the parent's conditions.

pub mod compiler;
pub mod controller;
pub mod lifecycle;
pub mod steps;

pub use compiler::{desired_workload, Workload, SKIPJOB_NAME_LABEL};
pub use controller::{error_policy, orchestrator, reconcile, SkipJobContext};
pub use lifecycle::{track, RunState};
