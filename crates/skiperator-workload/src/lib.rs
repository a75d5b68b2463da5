//! Building blocks shared by the parents that run pods
//!
//! Application and SKIPJob both describe one container plus an access policy.
//! This crate compiles that description into a pod template and provides the
//! reconcile steps both controllers run: ServiceAccount, GCP credentials,
//! NetworkPolicy and ServiceEntries. The per-hostname ingress steps are shared
//! with Routing.

pub mod gcp;
pub mod identity;
pub mod ingress;
pub mod parent;
pub mod pod;
pub mod steps;

pub use identity::{ClientSpec, IdentityProvider};
pub use ingress::{
    CertificateFinalizer, CertificateStep, GatewayStep, IngressDeriver, VirtualServiceStep,
};
pub use parent::{ParentIdentity, WorkloadParent};
pub use pod::{PodTemplateCompiler, WorkloadView};
pub use steps::{
    Desired, GcpAuthConfigMapStep, NetworkPolicyStep, OwnedObjectStep, ServiceAccountStep,
    ServiceEntryStep, StepContext,
};
