//! Application controller for Skiperator
//!
//! An Application is a long-running container exposed through a Service and,
//! optionally, through per-hostname ingress gateways. Reconciling it writes
//! the Deployment, Service, autoscaling, mesh security, monitoring and
//! identity client objects derived from its spec.

pub mod controller;
pub mod identity;
pub mod security;
pub mod workload;

pub use controller::{error_policy, orchestrator, reconcile, ApplicationContext, ApplicationIngress};
