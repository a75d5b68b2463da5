//! Custom Resource Definitions owned by Skiperator
//!
//! `Application`, `SKIPJob` and `Routing` are the parents; `AccessPolicy` and
//! the pod level settings are shared building blocks.

mod access_policy;
mod application;
mod condition;
mod pod;
mod routing;
mod skipjob;

pub use access_policy::{
    AccessPolicy, ExternalPort, ExternalRule, InboundPolicy, InternalPort, InternalRule,
    OutboundPolicy,
};
pub use application::{
    Application, ApplicationSpec, AuthorizationSettings, EntraIdSettings, IdPortenSettings,
    MaskinportenSettings, Replicas, Strategy,
};
pub use condition::{Condition, ConditionStatus};
pub use pod::{
    AdditionalPort, EnvFrom, FilesFrom, GcpAuth, GcpSettings, PodSettings, PrometheusConfig,
    Priority, Probe,
};
pub use routing::{Route, Routing, RoutingSpec};
pub use skipjob::{
    ContainerSettings, CronSettings, JobSettings, SkipJob, SkipJobSpec, DEFAULT_BACKOFF_LIMIT,
};
