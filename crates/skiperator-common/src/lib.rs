//! Common types for Skiperator: CRDs, status model, errors and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod mesh;
pub mod naming;
pub mod resources;
pub mod status;
pub mod telemetry;

pub use config::{OperatorConfig, ServerVersion};
pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher, ParentEvent};
pub use status::{SkiperatorStatus, Status, StatusEntry};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer placed on every parent resource
pub const FINALIZER: &str = "skip.statkart.no/finalizer";

/// Field manager / reporting component name
pub const OPERATOR_NAME: &str = "skiperator";

/// Label marking every object written by the operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label carrying the parent kind that produced an object
pub const PARENT_KIND_LABEL: &str = "skiperator.kartverket.no/controller";

/// Label selecting the pods of a workload
pub const APP_LABEL: &str = "app";

/// Annotation holding a fingerprint of the object as last written by the operator
pub const DESIRED_HASH_ANNOTATION: &str = "skiperator.kartverket.no/desired-hash";

/// Labels used for objects that cannot carry an owner reference (cross namespace)
pub mod parent_labels {
    /// Name of the parent
    pub const NAME: &str = "application.skiperator.no/app-name";
    /// Namespace of the parent
    pub const NAMESPACE: &str = "application.skiperator.no/app-namespace";
    /// Kind of the parent
    pub const KIND: &str = "application.skiperator.no/app";
}
