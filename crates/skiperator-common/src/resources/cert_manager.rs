//! cert-manager Certificate

use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Request for a TLS certificate stored in a Secret
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Secret the issued certificate is written to
    pub secret_name: String,
    /// Subject alternative names
    pub dns_names: Vec<String>,
    /// Issuer signing the certificate
    pub issuer_ref: IssuerRef,
}

/// Reference to a cert-manager issuer
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct IssuerRef {
    /// Issuer name
    pub name: String,
    /// Issuer or ClusterIssuer
    pub kind: String,
}
