//! SKIPJob CRD: a run-to-completion workload, optionally on a schedule

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::access_policy::AccessPolicy;
use super::pod::{EnvFrom, FilesFrom, GcpSettings, PodSettings, Priority, Probe, PrometheusConfig};
use crate::status::SkiperatorStatus;

/// Default number of retries before the Job is marked failed
pub const DEFAULT_BACKOFF_LIMIT: i32 = 6;

/// The job's container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSettings {
    /// Container image
    pub image: String,

    /// Overrides the image entrypoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Environment imported from ConfigMaps and Secrets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFrom>,

    /// Volumes mounted into the container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_from: Vec<FilesFrom>,

    /// Resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Declared network traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_policy: Option<AccessPolicy>,

    /// Never or OnFailure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,

    /// Liveness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<Probe>,

    /// Readiness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Probe>,

    /// Startup probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<Probe>,

    /// GCP workload identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpSettings>,

    /// Pod template tweaks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_settings: Option<PodSettings>,

    /// Scheduling priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

/// batch/v1 Job settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSettings {
    /// Wall clock limit for the whole Job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
    /// Retries before the Job fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
    /// Suspend the Job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    /// Garbage collect the Job this long after it finishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
}

/// CronJob schedule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronSettings {
    /// Cron expression
    pub schedule: String,
    /// IANA time zone of the schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    /// Suspend future runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    /// Deadline for starting a missed run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<i64>,
    /// Allow, Forbid or Replace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_policy: Option<String>,
}

/// A run-to-completion workload, a CronJob when `cron` is set
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "skiperator.kartverket.no",
    version = "v1alpha1",
    kind = "SKIPJob",
    root = "SkipJob",
    plural = "skipjobs",
    shortname = "skipjob",
    namespaced,
    status = "SkiperatorStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.summary.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SkipJobSpec {
    /// The job's container
    pub container: ContainerSettings,

    /// Job settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobSettings>,

    /// Schedule; a one-off Job is created when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<CronSettings>,

    /// Prometheus scraping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusConfig>,
}

impl SkipJobSpec {
    /// Fill in defaulted fields. Returns true when anything changed.
    pub fn apply_defaults(&mut self) -> bool {
        let before = self.clone();

        let job = self.job.get_or_insert_with(JobSettings::default);
        job.backoff_limit.get_or_insert(DEFAULT_BACKOFF_LIMIT);
        job.suspend.get_or_insert(false);
        self.container
            .restart_policy
            .get_or_insert_with(|| "Never".to_string());
        self.container.priority.get_or_insert_with(Priority::default);

        *self != before
    }

    /// Whether the job runs on a schedule
    pub fn is_cron(&self) -> bool {
        self.cron.is_some()
    }
}
