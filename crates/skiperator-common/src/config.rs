//! Operator configuration shared by every controller
//!
//! Built once at startup from CLI flags / environment (see the operator
//! binary) and passed into each controller context behind an `Arc`.

use std::fmt;

use crate::mesh;

/// Kubernetes API server version as reported by `/version`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
}

impl ServerVersion {
    /// Create a version from its numeric parts
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse the `major`/`minor` strings reported by the API server.
    ///
    /// Managed providers suffix the minor version (`"27+"`), which is ignored.
    pub fn parse(major: &str, minor: &str) -> Option<Self> {
        let digits = |s: &str| -> Option<u32> {
            let d: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
            d.parse().ok()
        };
        Some(Self::new(digits(major)?, digits(minor)?))
    }

    /// Parse a `"1.29"` style version string
    pub fn parse_dotted(s: &str) -> Option<Self> {
        let (major, minor) = s.trim_start_matches('v').split_once('.')?;
        Self::parse(major, minor)
    }

    /// PodDisruptionBudget `unhealthyPodEvictionPolicy` is available from 1.26
    pub fn supports_unhealthy_pod_eviction_policy(&self) -> bool {
        *self >= Self::new(1, 26)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Location of the cluster wide GCP workload identity ConfigMap
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigMapRef {
    /// Namespace of the ConfigMap
    pub namespace: String,
    /// Name of the ConfigMap
    pub name: String,
}

/// Runtime configuration for the operator
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Hostname suffixes routed through the internal ingress gateway
    pub internal_domains: Vec<String>,
    /// Namespace holding the ingress and egress gateways (and Certificates)
    pub gateway_namespace: String,
    /// Namespace of the Prometheus scraper allowed to reach metrics ports
    pub metrics_namespace: String,
    /// cert-manager ClusterIssuer used for ingress Certificates
    pub cluster_issuer: String,
    /// Cluster wide GCP workload identity ConfigMap
    pub gcp_identity_config: ConfigMapRef,
    /// Image pull secrets attached to every workload ServiceAccount
    pub image_pull_secrets: Vec<String>,
    /// API server version, used to gate version dependent fields
    pub server_version: ServerVersion,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            internal_domains: vec![".internal".to_string(), ".intern".to_string()],
            gateway_namespace: mesh::GATEWAY_NAMESPACE.to_string(),
            metrics_namespace: "istio-system".to_string(),
            cluster_issuer: "cluster-issuer".to_string(),
            gcp_identity_config: ConfigMapRef {
                namespace: "skiperator-system".to_string(),
                name: "gcp-identity-config".to_string(),
            },
            image_pull_secrets: vec!["github-auth".to_string()],
            server_version: ServerVersion::new(1, 29),
        }
    }
}

impl OperatorConfig {
    /// Whether a hostname is served by the internal ingress gateway
    pub fn is_internal_host(&self, host: &str) -> bool {
        self.internal_domains
            .iter()
            .any(|suffix| host.ends_with(suffix.as_str()))
    }
}
