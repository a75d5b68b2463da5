//! Identity-provider client registrations fulfilled by an external controller
//!
//! Each client writes its credentials to `spec.secretName`; the operator only
//! references that secret from the workload and never reads it.

use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// ID-porten (citizen login) client
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "nais.io",
    version = "v1",
    kind = "IDPortenClient",
    root = "IdPortenClient",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct IdPortenClientSpec {
    /// Secret receiving the client credentials
    pub secret_name: String,
    /// Name shown on the login page
    pub client_name: String,
    /// Base URI of the application
    pub client_uri: String,
    /// Login callbacks
    pub redirect_uris: Vec<String>,
    /// Front channel logout endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontchannel_logout_uri: Option<String>,
    /// Where users land after logging out
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_logout_redirect_uris: Vec<String>,
    /// Access token lifetime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_lifetime: Option<i32>,
    /// Session lifetime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_lifetime: Option<i32>,
}

/// Maskinporten (machine-to-machine) client
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "nais.io",
    version = "v1",
    kind = "MaskinportenClient",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MaskinportenClientSpec {
    /// Secret receiving the client credentials
    pub secret_name: String,
    /// Client name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Scopes consumed by the client
    pub scopes: MaskinportenScopes,
}

/// Scopes consumed by a Maskinporten client
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct MaskinportenScopes {
    /// Consumed scopes
    pub consumes: Vec<ConsumedScope>,
}

/// One consumed Maskinporten scope
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ConsumedScope {
    /// Scope name
    pub name: String,
}

/// Entra ID (Azure AD) application registration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "nais.io",
    version = "v1",
    kind = "AzureAdApplication",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct AzureAdApplicationSpec {
    /// Secret receiving the client credentials
    pub secret_name: String,
    /// Login callbacks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reply_urls: Vec<ReplyUrl>,
    /// Allow every user in the tenant
    #[serde(default)]
    pub allow_all_users: bool,
    /// Groups granted access
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<AzureAdClaims>,
}

/// A login callback
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ReplyUrl {
    /// Callback URL
    pub url: String,
}

/// Claims configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AzureAdClaims {
    /// Groups granted access
    pub groups: Vec<AzureAdGroup>,
}

/// A group by object ID
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AzureAdGroup {
    /// Group object ID
    pub id: String,
}
