//! Routing controller for Skiperator
//!
//! Path based routing from a single hostname to several Applications in the
//! same namespace.

pub mod controller;
pub mod targets;

pub use controller::{error_policy, orchestrator, reconcile, RoutingContext, RoutingIngress};
pub use targets::{resolve_routes, ResolvedRoutes};
