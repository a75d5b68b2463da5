//! Third-party kinds written by the operator
//!
//! Typed bindings for the Istio, cert-manager, Prometheus operator and
//! identity-provider CRDs. Only the fields the operator sets are modelled;
//! the CRDs themselves are installed by their own projects, so no schema is
//! generated here.

pub mod cert_manager;
pub mod identity;
pub mod istio;
pub mod monitoring;
