//! Network topology derivation for Skiperator
//!
//! Turns hostnames and access policies into the mesh and perimeter objects a
//! workload needs: NetworkPolicies, egress ServiceEntries, and per-hostname
//! Gateways, VirtualServices and Certificates. Everything here is pure except
//! resolving outbound Services through a [`ServiceResolver`].

pub mod hosts;
pub mod ingress;
pub mod network_policy;
pub mod service_entry;

pub use hosts::{parse_hostnames, Hostname};
pub use ingress::{IngressCompiler, IngressObjects, RouteTarget};
pub use network_policy::{
    resolve_service_port, KubeServiceResolver, NetworkPolicyCompiler, PolicyInput, ServiceResolver,
};
pub use service_entry::service_entries;
