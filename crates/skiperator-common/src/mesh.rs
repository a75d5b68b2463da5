//! Istio mesh constants shared by the derivation and workload crates
//!
//! Gateway pod labels, the sidecar container name and the annotations placed
//! on workload pods.

// =============================================================================
// Gateways
// =============================================================================

/// Namespace holding the ingress and egress gateway deployments
pub const GATEWAY_NAMESPACE: &str = "istio-gateways";

/// Pod label key identifying gateway deployments
pub const GATEWAY_SELECTOR_KEY: &str = "app";

/// Pod label value of the internal ingress gateway
pub const INGRESS_INTERNAL: &str = "istio-ingress-internal";

/// Pod label value of the external ingress gateway
pub const INGRESS_EXTERNAL: &str = "istio-ingress-external";

/// Pod label value of the egress gateway
pub const EGRESS_GATEWAY: &str = "istio-egressgateway";

/// Well-known label carrying a namespace's own name
pub const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

// =============================================================================
// Sidecar
// =============================================================================

/// Name of the injected Envoy sidecar container
pub const SIDECAR_CONTAINER: &str = "istio-proxy";

/// Pod annotation: hold application start until the proxy is ready
pub const HOLD_APPLICATION_ANNOTATION: &str = "proxy.istio.io/config";

/// Value of [`HOLD_APPLICATION_ANNOTATION`]
pub const HOLD_APPLICATION_VALUE: &str = "{ \"holdApplicationUntilProxyStarts\": true }";

/// Pod annotation merging application metrics into the sidecar's scrape endpoint
pub const MERGE_METRICS_ANNOTATION: &str = "prometheus.istio.io/merge-metrics";

/// Istio histogram series dropped from scrapes unless every metric is requested
pub const DROPPED_ISTIO_METRICS: &str =
    "istio_request_bytes_bucket|istio_response_bytes_bucket|istio_request_duration_milliseconds_bucket";

// =============================================================================
// Ports
// =============================================================================

/// Port the sidecar exposes merged metrics on
pub const SIDECAR_METRICS_PORT: i32 = 15020;

/// Gateway selector for an ingress hostname
pub fn ingress_gateway_for(internal: bool) -> &'static str {
    if internal {
        INGRESS_INTERNAL
    } else {
        INGRESS_EXTERNAL
    }
}
