//! Pod level settings shared by Application and SKIPJob

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An extra named container port
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AdditionalPort {
    /// Port name
    pub name: String,
    /// Port number
    pub port: i32,
    /// TCP, UDP or SCTP
    #[serde(default = "default_tcp")]
    pub protocol: String,
}

fn default_tcp() -> String {
    "TCP".to_string()
}

/// Source of environment variables
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvFrom {
    /// ConfigMap to import
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<String>,
    /// Secret to import
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// A volume mounted into the container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilesFrom {
    /// Mount path inside the container
    pub mount_path: String,
    /// ConfigMap backing the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<String>,
    /// Secret backing the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Name of an emptyDir volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<String>,
    /// PersistentVolumeClaim backing the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<String>,
}

impl FilesFrom {
    /// Name of the backing object, used as the volume name
    pub fn source_name(&self) -> Option<&str> {
        self.config_map
            .as_deref()
            .or(self.secret.as_deref())
            .or(self.empty_dir.as_deref())
            .or(self.persistent_volume_claim.as_deref())
    }
}

/// HTTP or TCP health probe
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    /// HTTP path; a TCP probe is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Port probed
    pub port: i32,
    /// Seconds before the first probe
    #[serde(default)]
    pub initial_delay: i32,
    /// Seconds between probes
    #[serde(default = "default_period")]
    pub period: i32,
    /// Probe timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: i32,
    /// Consecutive failures before the probe fails
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: i32,
    /// Consecutive successes before the probe succeeds
    #[serde(default = "default_success_threshold")]
    pub success_threshold: i32,
}

fn default_period() -> i32 {
    10
}

fn default_timeout() -> i32 {
    1
}

fn default_failure_threshold() -> i32 {
    3
}

fn default_success_threshold() -> i32 {
    1
}

/// Prometheus scraping of the workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusConfig {
    /// Metrics port
    pub port: i32,
    /// Metrics path
    #[serde(default = "default_metrics_path")]
    pub path: String,
    /// Keep every metric instead of dropping high cardinality Istio metrics
    #[serde(default)]
    pub allow_all_metrics: bool,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

/// GCP workload identity settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct GcpSettings {
    /// Authentication through workload identity federation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<GcpAuth>,
}

/// GCP service account to impersonate
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcpAuth {
    /// Email of the GCP service account
    pub service_account: String,
}

impl GcpSettings {
    /// The service account when GCP auth is configured
    pub fn service_account(&self) -> Option<&str> {
        self.auth
            .as_ref()
            .map(|a| a.service_account.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Pod template tweaks
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSettings {
    /// Extra pod annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Grace period before the pod is killed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
    /// Skip the default zone / node spread constraints
    #[serde(default)]
    pub disable_pod_spread_topology_constraints: bool,
}

/// Scheduling priority of a workload
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Preemptible
    Low,
    /// Default
    #[default]
    Medium,
    /// Critical
    High,
}

impl Priority {
    /// PriorityClass name
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Low => "skip-low",
            Self::Medium => "skip-medium",
            Self::High => "skip-high",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_from_source_name_prefers_first_set_field() {
        let files = FilesFrom {
            mount_path: "/config".to_string(),
            secret: Some("creds".to_string()),
            ..Default::default()
        };
        assert_eq!(files.source_name(), Some("creds"));
        assert_eq!(FilesFrom::default().source_name(), None);
    }

    #[test]
    fn probe_defaults_follow_kubernetes() {
        let probe: Probe = serde_json::from_value(serde_json::json!({"port": 8080})).unwrap();
        assert_eq!(probe.period, 10);
        assert_eq!(probe.failure_threshold, 3);
        assert!(probe.path.is_none());
    }

    #[test]
    fn empty_gcp_service_account_is_ignored() {
        let gcp = GcpSettings {
            auth: Some(GcpAuth {
                service_account: String::new(),
            }),
        };
        assert_eq!(gcp.service_account(), None);
    }
}
