//! Reconciliation engine shared by the Skiperator controllers
//!
//! - [`sync`]: idempotent create/update of derived objects with optimistic concurrency
//! - [`ownership`]: owner references and lifecycle labels on derived objects
//! - [`orphan`]: garbage collection of derived objects that are no longer desired
//! - [`orchestrator`]: the ordered step pipeline run for every parent

pub mod orchestrator;
pub mod orphan;
pub mod ownership;
pub mod parent;
pub mod sync;

pub use orchestrator::{retry_after, Orchestrator, ReconcileStep, StepFinalizer, StepOutcome};
pub use orphan::OrphanScope;
pub use parent::{KubeParentStore, Parent, ParentStore};
pub use sync::{SyncAction, Synchronizer};
