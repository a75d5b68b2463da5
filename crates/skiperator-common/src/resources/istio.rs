//! Istio networking and security kinds

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

// =============================================================================
// networking.istio.io
// =============================================================================

/// Ingress gateway listener configuration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "networking.istio.io",
    version = "v1",
    kind = "Gateway",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// Gateway pods the configuration applies to
    pub selector: BTreeMap<String, String>,
    /// Listeners
    pub servers: Vec<Server>,
}

/// A gateway listener
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Listener port
    pub port: GatewayPort,
    /// Hostnames served
    pub hosts: Vec<String>,
    /// TLS settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ServerTls>,
}

/// Port of a gateway listener
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct GatewayPort {
    /// Port number
    pub number: i32,
    /// Port name
    pub name: String,
    /// HTTP, HTTPS, TCP, ...
    pub protocol: String,
}

/// TLS settings of a gateway listener
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerTls {
    /// Answer plain HTTP with a redirect to HTTPS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_redirect: Option<bool>,
    /// SIMPLE, MUTUAL, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Secret in the gateway namespace holding the certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_name: Option<String>,
}

/// HTTP routing rules bound to gateways
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "networking.istio.io",
    version = "v1",
    kind = "VirtualService",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServiceSpec {
    /// Hostnames the rules apply to
    pub hosts: Vec<String>,
    /// Gateways the rules are bound to
    pub gateways: Vec<String>,
    /// Namespaces the rules are visible in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub export_to: Vec<String>,
    /// Ordered HTTP routes
    pub http: Vec<HttpRoute>,
}

/// An HTTP route
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct HttpRoute {
    /// Route name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Request matches; any match selects the route
    #[serde(default, rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub match_: Vec<HttpMatchRequest>,
    /// URI rewrite applied before forwarding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<HttpRewrite>,
    /// Destinations
    pub route: Vec<HttpRouteDestination>,
}

/// Request match
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct HttpMatchRequest {
    /// Match on the request URI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<StringMatch>,
}

/// String matcher
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct StringMatch {
    /// Prefix match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// URI rewrite
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct HttpRewrite {
    /// Replacement for the matched prefix
    pub uri: String,
}

/// A route destination
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct HttpRouteDestination {
    /// Target service
    pub destination: Destination,
}

/// Target service of a route
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Destination {
    /// Service host
    pub host: String,
    /// Service port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSelector>,
}

/// Port on a destination
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PortSelector {
    /// Port number
    pub number: i32,
}

/// Registers an external host in the mesh
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "networking.istio.io",
    version = "v1",
    kind = "ServiceEntry",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntrySpec {
    /// Hostnames
    pub hosts: Vec<String>,
    /// Namespaces the entry is visible in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub export_to: Vec<String>,
    /// Ports
    pub ports: Vec<ServicePort>,
    /// MESH_EXTERNAL or MESH_INTERNAL
    pub location: String,
    /// DNS, STATIC or NONE
    pub resolution: String,
    /// Static endpoints, used with STATIC resolution
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<WorkloadEntry>,
}

/// A ServiceEntry port
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ServicePort {
    /// Port number
    pub number: i32,
    /// Port name
    pub name: String,
    /// HTTP, HTTPS, TCP, ...
    pub protocol: String,
}

/// A static endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct WorkloadEntry {
    /// IP address
    pub address: String,
}

// =============================================================================
// security.istio.io
// =============================================================================

/// Workload selector shared by the security kinds
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSelector {
    /// Pod labels
    pub match_labels: BTreeMap<String, String>,
}

/// Mutual TLS mode for a workload
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "security.istio.io",
    version = "v1",
    kind = "PeerAuthentication",
    namespaced,
    schema = "disabled"
)]
pub struct PeerAuthenticationSpec {
    /// Workloads the setting applies to
    pub selector: WorkloadSelector,
    /// mTLS mode
    pub mtls: PeerMtls,
}

/// mTLS mode
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PeerMtls {
    /// STRICT, PERMISSIVE or DISABLE
    pub mode: String,
}

/// Allow or deny rules for requests to a workload
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "security.istio.io",
    version = "v1",
    kind = "AuthorizationPolicy",
    namespaced,
    schema = "disabled"
)]
pub struct AuthorizationPolicySpec {
    /// Workloads the policy applies to
    pub selector: WorkloadSelector,
    /// ALLOW or DENY
    pub action: String,
    /// Rules; a request matching any rule triggers the action
    pub rules: Vec<AuthorizationRule>,
}

/// An authorization rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AuthorizationRule {
    /// Request sources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<RuleFrom>,
    /// Request operations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<RuleTo>,
}

/// Source clause
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RuleFrom {
    /// Source attributes
    pub source: Source,
}

/// Request source attributes
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Source {
    /// Source namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

/// Operation clause
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RuleTo {
    /// Operation attributes
    pub operation: Operation,
}

/// Request operation attributes
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Matched paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    /// Paths excluded from the match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_paths: Vec<String>,
}

/// JWT validation for requests to a workload
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "security.istio.io",
    version = "v1",
    kind = "RequestAuthentication",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct RequestAuthenticationSpec {
    /// Workloads the validation applies to
    pub selector: WorkloadSelector,
    /// Accepted token issuers
    pub jwt_rules: Vec<JwtRule>,
}

/// An accepted JWT issuer
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JwtRule {
    /// Token issuer
    pub issuer: String,
    /// Key set location
    pub jwks_uri: String,
    /// Accepted audiences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audiences: Vec<String>,
    /// Pass the token on to the workload
    #[serde(default)]
    pub forward_original_token: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn kinds_use_istio_v1_groups() {
        assert_eq!(Gateway::api_version(&()), "networking.istio.io/v1");
        assert_eq!(ServiceEntry::kind(&()), "ServiceEntry");
        assert_eq!(AuthorizationPolicy::api_version(&()), "security.istio.io/v1");
    }

    #[test]
    fn http_route_match_serializes_as_match() {
        let route = HttpRoute {
            match_: vec![HttpMatchRequest {
                uri: Some(StringMatch {
                    prefix: Some("/api".to_string()),
                }),
            }],
            route: vec![],
            ..Default::default()
        };
        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["match"][0]["uri"]["prefix"], "/api");
        assert!(json.get("rewrite").is_none());
    }
}
