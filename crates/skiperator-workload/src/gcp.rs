//! GCP workload identity
//!
//! Workloads with `gcp.auth.serviceAccount` get a per-parent ConfigMap holding
//! an external-account credential configuration. It points Google client
//! libraries at the projected Kubernetes ServiceAccount token and asks them to
//! impersonate the configured GCP service account. Pool and provider come from
//! a cluster wide ConfigMap.

use k8s_openapi::api::core::v1::ConfigMap;
use serde_json::json;
use skiperator_common::config::ConfigMapRef;
use skiperator_common::kube_utils::object_meta;
use skiperator_common::{Error, Result};

/// Pod volume carrying the token and credential file
pub const VOLUME_NAME: &str = "gcp-ksa";
/// Mount path of [`VOLUME_NAME`]
pub const GCP_TOKEN_DIR: &str = "/var/run/secrets/tokens/gcp-ksa";
/// Credential file inside [`GCP_TOKEN_DIR`]
pub const GCP_CREDENTIALS_FILE: &str = "google-application-credentials.json";
/// Projected token file inside [`GCP_TOKEN_DIR`]
pub const TOKEN_FILE: &str = "token";
/// Audience of the projected token
pub const TOKEN_AUDIENCE: &str = "kubernetes.default.svc";
/// Key of the credential configuration in the per-parent ConfigMap
pub const CONFIG_KEY: &str = "config";

/// Keys read from the cluster wide identity ConfigMap
const POOL_KEY: &str = "workloadIdentityPool";
const PROVIDER_KEY: &str = "identityProvider";

/// Name of the per-parent credential ConfigMap
pub fn config_map_name(parent: &str) -> String {
    format!("{parent}-gcp-auth")
}

/// Build the credential ConfigMap for a parent.
///
/// `identity` is the cluster wide identity ConfigMap; a missing pool or
/// provider key is a configuration error.
pub fn auth_config_map(
    parent: &str,
    namespace: &str,
    service_account: &str,
    identity: &ConfigMap,
    identity_ref: &ConfigMapRef,
) -> Result<ConfigMap> {
    let data = identity.data.clone().unwrap_or_default();
    let lookup = |key: &str| {
        data.get(key).filter(|v| !v.is_empty()).cloned().ok_or_else(|| {
            Error::config(format!(
                "configmap {}/{} has no {key}",
                identity_ref.namespace, identity_ref.name
            ))
        })
    };
    let pool = lookup(POOL_KEY)?;
    let provider = lookup(PROVIDER_KEY)?;

    let credentials = json!({
        "type": "external_account",
        "audience": format!("identitynamespace:{pool}:{provider}"),
        "service_account_impersonation_url": format!(
            "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{service_account}:generateAccessToken"
        ),
        "subject_token_type": "urn:ietf:params:oauth:token-type:jwt",
        "token_url": "https://sts.googleapis.com/v1/token",
        "credential_source": {
            "file": format!("{GCP_TOKEN_DIR}/{TOKEN_FILE}"),
        },
    });

    Ok(ConfigMap {
        metadata: object_meta(config_map_name(parent), namespace),
        data: Some(
            [(CONFIG_KEY.to_string(), serde_json::to_string_pretty(&credentials)?)]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    })
}
