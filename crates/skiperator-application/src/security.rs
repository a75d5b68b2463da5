//! Mesh security and scraping for an Application

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use skiperator_common::crd::Application;
use skiperator_common::kube_utils::object_meta;
use skiperator_common::resources::istio::{
    AuthorizationPolicy, AuthorizationPolicySpec, AuthorizationRule, Operation,
    PeerAuthentication, PeerAuthenticationSpec, PeerMtls, RequestAuthentication,
    RequestAuthenticationSpec, RuleFrom, RuleTo, Source, WorkloadSelector,
};
use skiperator_common::resources::monitoring::{
    Endpoint, NamespaceSelector, RelabelConfig, ServiceMonitor, ServiceMonitorSpec,
};
use skiperator_common::mesh::DROPPED_ISTIO_METRICS;
use skiperator_common::{OperatorConfig, Result, APP_LABEL};
use skiperator_workload::{Desired, IdentityProvider, ParentIdentity};

/// Paths the ingress gateway may not reach unless explicitly allowed
pub const BLOCKED_PATHS: [&str; 2] = ["/actuator", "/actuator/*"];

const SCRAPE_INTERVAL: &str = "60s";

fn selector(name: &str) -> WorkloadSelector {
    WorkloadSelector {
        match_labels: BTreeMap::from([(APP_LABEL.to_string(), name.to_string())]),
    }
}

/// Name of the policy blocking internal paths
pub fn deny_policy_name(app: &str) -> String {
    format!("{app}-deny")
}

/// STRICT mutual TLS for the Application's pods
pub fn desired_peer_authentication(app: &Application) -> Result<Desired<PeerAuthentication>> {
    let id = ParentIdentity::of(app)?;
    Ok(Desired::Apply(PeerAuthentication {
        metadata: object_meta(&id.name, &id.namespace),
        spec: PeerAuthenticationSpec {
            selector: selector(&id.name),
            mtls: PeerMtls {
                mode: "STRICT".to_string(),
            },
        },
    }))
}

/// Deny requests from the ingress gateways to [`BLOCKED_PATHS`], minus the
/// allow list. Removed when every path is allowed.
pub fn desired_authorization_policy(
    app: &Application,
    config: &OperatorConfig,
) -> Result<Desired<AuthorizationPolicy>> {
    let id = ParentIdentity::of(app)?;
    let name = deny_policy_name(&id.name);
    let settings = app.spec.authorization_settings.clone().unwrap_or_default();
    if settings.allow_all {
        return Ok(Desired::Remove(name));
    }

    Ok(Desired::Apply(AuthorizationPolicy {
        metadata: object_meta(name, &id.namespace),
        spec: AuthorizationPolicySpec {
            selector: selector(&id.name),
            action: "DENY".to_string(),
            rules: vec![AuthorizationRule {
                from: vec![RuleFrom {
                    source: Source {
                        namespaces: vec![config.gateway_namespace.clone()],
                    },
                }],
                to: vec![RuleTo {
                    operation: Operation {
                        paths: BLOCKED_PATHS.iter().map(|p| p.to_string()).collect(),
                        not_paths: settings.allow_list,
                    },
                }],
            }],
        },
    }))
}

/// JWT validation for tokens of the enabled identity providers
pub fn desired_request_authentication(
    app: &Application,
) -> Result<Desired<RequestAuthentication>> {
    let id = ParentIdentity::of(app)?;
    let jwt_rules: Vec<_> = IdentityProvider::enabled(&app.spec)
        .iter()
        .filter_map(IdentityProvider::jwt_rule)
        .collect();
    if jwt_rules.is_empty() {
        return Ok(Desired::Remove(id.name));
    }

    Ok(Desired::Apply(RequestAuthentication {
        metadata: object_meta(&id.name, &id.namespace),
        spec: RequestAuthenticationSpec {
            selector: selector(&id.name),
            jwt_rules,
        },
    }))
}

/// Scrape configuration for the Application's Service
pub fn desired_service_monitor(app: &Application) -> Result<Desired<ServiceMonitor>> {
    let id = ParentIdentity::of(app)?;
    let Some(prometheus) = app.spec.prometheus.as_ref() else {
        return Ok(Desired::Remove(id.name));
    };

    let metric_relabelings = if prometheus.allow_all_metrics {
        Vec::new()
    } else {
        vec![RelabelConfig {
            action: "drop".to_string(),
            source_labels: vec!["__name__".to_string()],
            regex: Some(DROPPED_ISTIO_METRICS.to_string()),
        }]
    };

    Ok(Desired::Apply(ServiceMonitor {
        metadata: object_meta(&id.name, &id.namespace),
        spec: ServiceMonitorSpec {
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(APP_LABEL.to_string(), id.name.clone())])),
                ..Default::default()
            },
            namespace_selector: Some(NamespaceSelector {
                match_names: vec![id.namespace.clone()],
            }),
            endpoints: vec![Endpoint {
                target_port: Some(IntOrString::Int(prometheus.port)),
                path: Some(prometheus.path.clone()),
                interval: Some(SCRAPE_INTERVAL.to_string()),
                metric_relabelings,
            }],
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiperator_common::crd::{
        ApplicationSpec, AuthorizationSettings, EntraIdSettings, MaskinportenSettings,
        PrometheusConfig,
    };

    fn app(spec: ApplicationSpec) -> Application {
        let mut app = Application::new("my-app", spec);
        app.metadata.namespace = Some("team-a".to_string());
        app.metadata.uid = Some("uid-1".to_string());
        app
    }

    /// Story: actuator endpoints are hidden from the internet unless allowed
    #[test]
    fn story_actuator_is_blocked_from_gateways() {
        let config = OperatorConfig::default();
        let spec = ApplicationSpec {
            authorization_settings: Some(AuthorizationSettings {
                allow_all: false,
                allow_list: vec!["/actuator/health".to_string()],
            }),
            ..Default::default()
        };
        let Desired::Apply(policy) = desired_authorization_policy(&app(spec), &config).unwrap() else {
            panic!("expected a policy");
        };
        assert_eq!(policy.metadata.name.as_deref(), Some("my-app-deny"));
        assert_eq!(policy.spec.action, "DENY");
        let rule = &policy.spec.rules[0];
        assert_eq!(rule.from[0].source.namespaces, vec!["istio-gateways"]);
        assert_eq!(rule.to[0].operation.not_paths, vec!["/actuator/health"]);

        let open = ApplicationSpec {
            authorization_settings: Some(AuthorizationSettings {
                allow_all: true,
                allow_list: vec![],
            }),
            ..Default::default()
        };
        assert!(matches!(
            desired_authorization_policy(&app(open), &config).unwrap(),
            Desired::Remove(name) if name == "my-app-deny"
        ));
    }

    #[test]
    fn request_authentication_follows_providers_with_issuers() {
        assert!(matches!(
            desired_request_authentication(&app(ApplicationSpec::default())).unwrap(),
            Desired::Remove(_)
        ));

        // Entra ID has no fixed issuer, so it alone produces no rule
        let entra_only = ApplicationSpec {
            entra_id: Some(EntraIdSettings {
                enabled: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            desired_request_authentication(&app(entra_only)).unwrap(),
            Desired::Remove(_)
        ));

        let spec = ApplicationSpec {
            maskinporten: Some(MaskinportenSettings {
                enabled: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let Desired::Apply(ra) = desired_request_authentication(&app(spec)).unwrap() else {
            panic!("expected a RequestAuthentication");
        };
        assert_eq!(ra.spec.jwt_rules.len(), 1);
        assert!(ra.spec.jwt_rules[0].forward_original_token);
    }

    #[test]
    fn service_monitor_drops_istio_histograms_by_default() {
        let mut prometheus = PrometheusConfig {
            port: 8181,
            path: "/prometheus".to_string(),
            allow_all_metrics: false,
        };
        let spec = ApplicationSpec {
            prometheus: Some(prometheus.clone()),
            ..Default::default()
        };
        let Desired::Apply(monitor) = desired_service_monitor(&app(spec)).unwrap() else {
            panic!("expected a ServiceMonitor");
        };
        let endpoint = &monitor.spec.endpoints[0];
        assert_eq!(endpoint.target_port, Some(IntOrString::Int(8181)));
        assert_eq!(endpoint.metric_relabelings[0].action, "drop");

        prometheus.allow_all_metrics = true;
        let spec = ApplicationSpec {
            prometheus: Some(prometheus),
            ..Default::default()
        };
        let Desired::Apply(monitor) = desired_service_monitor(&app(spec)).unwrap() else {
            panic!("expected a ServiceMonitor");
        };
        assert!(monitor.spec.endpoints[0].metric_relabelings.is_empty());
    }

    #[test]
    fn peer_authentication_is_strict() {
        let Desired::Apply(pa) = desired_peer_authentication(&app(ApplicationSpec::default())).unwrap() else {
            panic!("expected a PeerAuthentication");
        };
        assert_eq!(pa.spec.mtls.mode, "STRICT");
        assert_eq!(pa.spec.selector.match_labels[APP_LABEL], "my-app");
    }
}
