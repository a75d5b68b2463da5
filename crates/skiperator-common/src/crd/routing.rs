//! Routing CRD: path based routing from one hostname to several applications

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::SkiperatorStatus;

/// One path prefix routed to an application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Path prefix matched on the request
    pub path_prefix: String,
    /// Application receiving the traffic (in the Routing's namespace)
    pub target_app: String,
    /// Port on the application's Service; its main port when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Strip the prefix before forwarding
    #[serde(default)]
    pub rewrite_uri: bool,
}

/// Routes from a hostname to applications in the same namespace
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "skiperator.kartverket.no",
    version = "v1alpha1",
    kind = "Routing",
    plural = "routings",
    namespaced,
    status = "SkiperatorStatus",
    printcolumn = r#"{"name":"Hostname","type":"string","jsonPath":".spec.hostname"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.summary.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RoutingSpec {
    /// Hostname, optionally `host+certificateSecret`
    pub hostname: String,

    /// Routes, matched in order
    #[serde(default)]
    pub routes: Vec<Route>,

    /// Redirect plain HTTP to HTTPS on the gateway
    #[serde(
        default,
        rename = "redirectToHTTPS",
        skip_serializing_if = "Option::is_none"
    )]
    pub redirect_to_https: Option<bool>,
}

impl RoutingSpec {
    /// Fill in defaulted fields. Returns true when anything changed.
    pub fn apply_defaults(&mut self) -> bool {
        if self.redirect_to_https.is_none() {
            self.redirect_to_https = Some(true);
            return true;
        }
        false
    }

    /// Distinct target applications, in first-seen order
    pub fn target_apps(&self) -> Vec<&str> {
        let mut apps: Vec<&str> = Vec::new();
        for route in &self.routes {
            if !apps.contains(&route.target_app.as_str()) {
                apps.push(&route.target_app);
            }
        }
        apps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_apps_are_deduplicated() {
        let spec = RoutingSpec {
            hostname: "kartverket.no".to_string(),
            routes: vec![
                Route {
                    path_prefix: "/api".to_string(),
                    target_app: "backend".to_string(),
                    ..Default::default()
                },
                Route {
                    path_prefix: "/".to_string(),
                    target_app: "frontend".to_string(),
                    ..Default::default()
                },
                Route {
                    path_prefix: "/v2".to_string(),
                    target_app: "backend".to_string(),
                    ..Default::default()
                },
            ],
            redirect_to_https: None,
        };
        assert_eq!(spec.target_apps(), vec!["backend", "frontend"]);
    }

    #[test]
    fn redirect_defaults_on() {
        let mut spec = RoutingSpec::default();
        assert!(spec.apply_defaults());
        assert!(!spec.apply_defaults());
        assert_eq!(spec.redirect_to_https, Some(true));
    }
}
