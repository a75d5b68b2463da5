//! Command line and environment configuration

use clap::{Parser, ValueEnum};
use skiperator_common::config::ConfigMapRef;
use skiperator_common::telemetry::LogFormat;
use skiperator_common::{OperatorConfig, ServerVersion};

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// JSON lines
    Json,
    /// Human readable
    Pretty,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Pretty => LogFormat::Pretty,
        }
    }
}

/// Skiperator - turns Applications, SKIPJobs and Routings into cluster objects
#[derive(Parser, Debug)]
#[command(name = "skiperator", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Log output format
    #[arg(long, env = "SKIPERATOR_LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormatArg,

    /// Hostname suffixes served by the internal ingress gateway
    #[arg(
        long,
        env = "SKIPERATOR_INTERNAL_DOMAINS",
        value_delimiter = ',',
        default_value = ".internal,.intern"
    )]
    pub internal_domains: Vec<String>,

    /// Namespace of the ingress and egress gateways
    #[arg(long, env = "SKIPERATOR_GATEWAY_NAMESPACE", default_value = "istio-gateways")]
    pub gateway_namespace: String,

    /// Namespace of the Prometheus scraper
    #[arg(long, env = "SKIPERATOR_METRICS_NAMESPACE", default_value = "istio-system")]
    pub metrics_namespace: String,

    /// cert-manager ClusterIssuer for ingress Certificates
    #[arg(long, env = "SKIPERATOR_CLUSTER_ISSUER", default_value = "cluster-issuer")]
    pub cluster_issuer: String,

    /// Namespace of the GCP workload identity ConfigMap
    #[arg(
        long,
        env = "SKIPERATOR_GCP_IDENTITY_CONFIG_NAMESPACE",
        default_value = "skiperator-system"
    )]
    pub gcp_identity_config_namespace: String,

    /// Name of the GCP workload identity ConfigMap
    #[arg(
        long,
        env = "SKIPERATOR_GCP_IDENTITY_CONFIG_NAME",
        default_value = "gcp-identity-config"
    )]
    pub gcp_identity_config_name: String,

    /// Image pull secrets attached to workload ServiceAccounts
    #[arg(
        long,
        env = "SKIPERATOR_IMAGE_PULL_SECRETS",
        value_delimiter = ',',
        default_value = "github-auth"
    )]
    pub image_pull_secrets: Vec<String>,

    /// API server version (e.g. 1.29); discovered from the cluster when unset
    #[arg(long, env = "SKIPERATOR_SERVER_VERSION", value_parser = parse_server_version)]
    pub server_version: Option<ServerVersion>,
}

fn parse_server_version(s: &str) -> Result<ServerVersion, String> {
    ServerVersion::parse_dotted(s).ok_or_else(|| format!("expected MAJOR.MINOR, got {s:?}"))
}

impl Cli {
    /// Operator configuration for the given API server version
    pub fn operator_config(&self, server_version: ServerVersion) -> OperatorConfig {
        OperatorConfig {
            internal_domains: self.internal_domains.clone(),
            gateway_namespace: self.gateway_namespace.clone(),
            metrics_namespace: self.metrics_namespace.clone(),
            cluster_issuer: self.cluster_issuer.clone(),
            gcp_identity_config: ConfigMapRef {
                namespace: self.gcp_identity_config_namespace.clone(),
                name: self.gcp_identity_config_name.clone(),
            },
            image_pull_secrets: self
                .image_pull_secrets
                .iter()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect(),
            server_version,
        }
    }
}
