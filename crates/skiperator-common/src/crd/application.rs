//! Application CRD: a long running, optionally exposed workload

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::access_policy::AccessPolicy;
use super::pod::{
    AdditionalPort, EnvFrom, FilesFrom, GcpSettings, PodSettings, Priority, Probe,
    PrometheusConfig,
};
use crate::status::SkiperatorStatus;

// =============================================================================
// Scaling
// =============================================================================

/// Replica range and autoscaling target
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Replicas {
    /// Minimum replicas
    pub min: i32,
    /// Maximum replicas
    pub max: i32,
    /// Average CPU utilization the autoscaler targets, in percent
    #[serde(default = "default_cpu_target")]
    pub target_cpu_utilization: i32,
}

fn default_cpu_target() -> i32 {
    80
}

impl Default for Replicas {
    fn default() -> Self {
        Self {
            min: 2,
            max: 5,
            target_cpu_utilization: default_cpu_target(),
        }
    }
}

impl Replicas {
    /// Whether a HorizontalPodAutoscaler should manage the replica count
    pub fn autoscales(&self) -> bool {
        self.max > self.min
    }
}

/// Deployment rollout strategy
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Strategy {
    /// Replace pods gradually
    #[default]
    RollingUpdate,
    /// Kill all pods before creating new ones
    Recreate,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RollingUpdate => write!(f, "RollingUpdate"),
            Self::Recreate => write!(f, "Recreate"),
        }
    }
}

// =============================================================================
// Identity providers
// =============================================================================

/// ID-porten login for the application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdPortenSettings {
    /// Register a client
    pub enabled: bool,
    /// Client name shown to end users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Path of the login callback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_path: Option<String>,
    /// Path of the front channel logout endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontchannel_logout_path: Option<String>,
    /// Access token lifetime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_lifetime: Option<i32>,
    /// Session lifetime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_lifetime: Option<i32>,
}

/// Maskinporten machine-to-machine client
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MaskinportenSettings {
    /// Register a client
    pub enabled: bool,
    /// Client name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Scopes the client consumes
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Entra ID (Azure AD) application registration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntraIdSettings {
    /// Register an application
    pub enabled: bool,
    /// Allow every user in the tenant
    #[serde(default)]
    pub allow_all_users: bool,
    /// Group object IDs granted access
    #[serde(default)]
    pub groups: Vec<String>,
    /// Paths of login callbacks
    #[serde(default)]
    pub reply_paths: Vec<String>,
}

/// Access to paths that are blocked from the ingress gateway by default
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationSettings {
    /// Expose every path, including `/actuator`
    #[serde(default)]
    pub allow_all: bool,
    /// Individual blocked paths to expose
    #[serde(default)]
    pub allow_list: Vec<String>,
}

// =============================================================================
// CRD
// =============================================================================

/// A long running workload with optional ingress, autoscaling and identity
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "skiperator.kartverket.no",
    version = "v1alpha1",
    kind = "Application",
    plural = "applications",
    shortname = "app",
    namespaced,
    status = "SkiperatorStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.summary.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// Container image
    pub image: String,

    /// Overrides the image entrypoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Main container port
    pub port: i32,

    /// Extra container ports exposed on the Service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_ports: Vec<AdditionalPort>,

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

    /// Replica range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<Replicas>,

    /// Rollout strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,

    /// Hostnames routed to the application, optionally `host+certificateSecret`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingresses: Vec<String>,

    /// Redirect plain HTTP to HTTPS on the gateway
    #[serde(
        default,
        rename = "redirectToHTTPS",
        skip_serializing_if = "Option::is_none"
    )]
    pub redirect_to_https: Option<bool>,

    /// Declared network traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_policy: Option<AccessPolicy>,

    /// Liveness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<Probe>,

    /// Readiness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Probe>,

    /// Startup probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<Probe>,

    /// Prometheus scraping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusConfig>,

    /// ID-porten client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idporten: Option<IdPortenSettings>,

    /// Maskinporten client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maskinporten: Option<MaskinportenSettings>,

    /// Entra ID application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entra_id: Option<EntraIdSettings>,

    /// Blocked path overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_settings: Option<AuthorizationSettings>,

    /// Create a PodDisruptionBudget
    #[serde(
        default,
        rename = "enablePDB",
        skip_serializing_if = "Option::is_none"
    )]
    pub enable_pdb: Option<bool>,

    /// GCP workload identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpSettings>,

    /// Extra labels on every derived object
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Pod template tweaks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_settings: Option<PodSettings>,

    /// Scheduling priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,

    /// Owning team
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
}

impl ApplicationSpec {
    /// Fill in defaulted fields. Returns true when anything changed.
    pub fn apply_defaults(&mut self) -> bool {
        let before = self.clone();

        self.redirect_to_https.get_or_insert(true);
        self.enable_pdb.get_or_insert(true);
        self.replicas.get_or_insert_with(Replicas::default);
        self.strategy.get_or_insert_with(Strategy::default);
        self.priority.get_or_insert_with(Priority::default);

        *self != before
    }

    /// Replica range, defaulted when unset
    pub fn replicas(&self) -> Replicas {
        self.replicas.clone().unwrap_or_default()
    }

    /// Whether plain HTTP requests are redirected to HTTPS
    pub fn redirects_to_https(&self) -> bool {
        self.redirect_to_https.unwrap_or(true)
    }

    /// Whether a PodDisruptionBudget is wanted
    pub fn pdb_enabled(&self) -> bool {
        self.enable_pdb.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied_once() {
        let mut spec = ApplicationSpec {
            image: "nginx".to_string(),
            port: 8080,
            ..Default::default()
        };
        assert!(spec.apply_defaults());
        assert_eq!(spec.redirect_to_https, Some(true));
        assert_eq!(spec.replicas, Some(Replicas::default()));
        assert!(!spec.apply_defaults());
    }

    #[test]
    fn defaults_keep_user_choices() {
        let mut spec = ApplicationSpec {
            redirect_to_https: Some(false),
            enable_pdb: Some(false),
            ..Default::default()
        };
        spec.apply_defaults();
        assert!(!spec.redirects_to_https());
        assert!(!spec.pdb_enabled());
    }

    #[test]
    fn fixed_replica_count_does_not_autoscale() {
        let r = Replicas {
            min: 3,
            max: 3,
            target_cpu_utilization: 80,
        };
        assert!(!r.autoscales());
        assert!(Replicas::default().autoscales());
    }

    #[test]
    fn parses_camel_case_manifest() {
        let spec: ApplicationSpec = serde_json::from_value(serde_json::json!({
            "image": "ghcr.io/kartverket/app:1",
            "port": 8080,
            "ingresses": ["app.kartverket.no"],
            "redirectToHTTPS": false,
            "enablePDB": false,
            "accessPolicy": {"outbound": {"external": [{"host": "example.com"}]}}
        }))
        .expect("manifest should parse");
        assert_eq!(spec.redirect_to_https, Some(false));
        assert_eq!(spec.enable_pdb, Some(false));
        assert_eq!(spec.access_policy.unwrap().external_rules()[0].host, "example.com");
    }
}
