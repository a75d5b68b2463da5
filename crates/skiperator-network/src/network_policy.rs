//! NetworkPolicy derivation
//!
//! Each workload parent gets exactly one NetworkPolicy named after the parent
//! and selecting its pods by `app=<parent>`:
//!
//! - **Ingress**: the internal and/or external ingress gateway (depending on
//!   which kinds of hostnames the parent exposes), one peer rule per inbound
//!   access rule, and the metrics scraper when metrics are configured.
//! - **Egress**: one rule per outbound access rule, resolved against the live
//!   Service of the target application, plus one rule per distinct external
//!   port towards the egress gateway.
//!
//! Routing parents get one additional policy per target application that
//! admits the ingress gateway to the application's pods.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use kube::Client;
use skiperator_common::crd::{AccessPolicy, InternalRule};
use skiperator_common::kube_utils::object_meta;
use skiperator_common::mesh::{
    ingress_gateway_for, EGRESS_GATEWAY, GATEWAY_SELECTOR_KEY, NAMESPACE_NAME_LABEL,
    SIDECAR_METRICS_PORT,
};
use skiperator_common::naming::{derived_name, ROUTING};
use skiperator_common::{Error, OperatorConfig, Result, APP_LABEL};

#[cfg(test)]
use mockall::automock;

use crate::hosts::Hostname;
use crate::service_entry::effective_ports;

/// Looks up the Service fronting an application
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// Fetch a Service, `None` when it does not exist
    async fn resolve(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
}

/// [`ServiceResolver`] backed by the Kubernetes API
pub struct KubeServiceResolver {
    client: Client,
}

impl KubeServiceResolver {
    /// Create a resolver on the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceResolver for KubeServiceResolver {
    async fn resolve(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Network facing description of one workload parent
#[derive(Clone, Debug)]
pub struct PolicyInput<'a> {
    /// Parent name, also the pods' `app` label
    pub name: &'a str,
    /// Parent namespace
    pub namespace: &'a str,
    /// Main container port; `None` for workloads that serve nothing
    pub port: Option<i32>,
    /// Exposed hostnames
    pub hostnames: &'a [Hostname],
    /// Declared traffic
    pub access_policy: Option<&'a AccessPolicy>,
    /// Metrics port scraped by Prometheus
    pub metrics_port: Option<i32>,
}

// =============================================================================
// Compiler
// =============================================================================

/// Derives NetworkPolicies from access policies
pub struct NetworkPolicyCompiler<'a> {
    config: &'a OperatorConfig,
    resolver: &'a dyn ServiceResolver,
}

impl<'a> NetworkPolicyCompiler<'a> {
    /// Create a compiler resolving outbound rules with `resolver`
    pub fn new(config: &'a OperatorConfig, resolver: &'a dyn ServiceResolver) -> Self {
        Self { config, resolver }
    }

    /// Derive the NetworkPolicy of a workload parent
    pub async fn compile(&self, input: &PolicyInput<'_>) -> Result<NetworkPolicy> {
        let ingress = self.ingress_rules(input);
        let egress = self.egress_rules(input).await?;
        Ok(build_policy(
            input.name,
            input.namespace,
            app_selector(input.name),
            ingress,
            egress,
        ))
    }

    fn ingress_rules(&self, input: &PolicyInput<'_>) -> Vec<NetworkPolicyIngressRule> {
        let mut rules = Vec::new();
        let container_ports = input.port.map(|p| vec![tcp_port(p)]);

        for internal in [true, false] {
            if input.hostnames.iter().any(|h| h.internal == internal) {
                rules.push(NetworkPolicyIngressRule {
                    from: Some(vec![self.gateway_peer(ingress_gateway_for(internal))]),
                    ports: container_ports.clone(),
                });
            }
        }

        if let Some(policy) = input.access_policy {
            for rule in policy.inbound_rules() {
                let ports = if rule.ports.is_empty() {
                    container_ports.clone()
                } else {
                    Some(rule_ports(rule))
                };
                rules.push(NetworkPolicyIngressRule {
                    from: Some(vec![rule_peer(rule, input.namespace, app_selector(&rule.application))]),
                    ports,
                });
            }
        }

        if let Some(metrics_port) = input.metrics_port {
            rules.push(NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    namespace_selector: Some(namespace_by_name(&self.config.metrics_namespace)),
                    ..Default::default()
                }]),
                ports: Some(vec![tcp_port(metrics_port), tcp_port(SIDECAR_METRICS_PORT)]),
            });
        }

        rules
    }

    async fn egress_rules(&self, input: &PolicyInput<'_>) -> Result<Vec<NetworkPolicyEgressRule>> {
        let Some(policy) = input.access_policy else {
            return Ok(Vec::new());
        };

        let mut rules = Vec::new();
        for rule in policy.outbound_rules() {
            rules.push(self.internal_egress(input, rule).await?);
        }

        let mut external_ports = BTreeSet::new();
        for rule in policy.external_rules() {
            let ports = effective_ports(rule).map_err(|e| match e {
                Error::Derivation { message, .. } => Error::derivation_for(input.name, message),
                other => other,
            })?;
            external_ports.extend(ports.into_iter().map(|p| p.number));
        }
        for port in external_ports {
            rules.push(NetworkPolicyEgressRule {
                to: Some(vec![self.gateway_peer(EGRESS_GATEWAY)]),
                ports: Some(vec![tcp_port(port)]),
            });
        }

        Ok(rules)
    }

    /// Egress towards one internal application.
    ///
    /// Namespace-label rules cannot be tied to one Service and use the rule's
    /// own ports; all other rules are resolved against the live Service.
    async fn internal_egress(
        &self,
        input: &PolicyInput<'_>,
        rule: &InternalRule,
    ) -> Result<NetworkPolicyEgressRule> {
        if rule.namespaces_by_label.is_some() {
            return Ok(NetworkPolicyEgressRule {
                to: Some(vec![rule_peer(rule, input.namespace, app_selector(&rule.application))]),
                ports: (!rule.ports.is_empty()).then(|| rule_ports(rule)),
            });
        }

        let namespace = rule.namespace_or(input.namespace);
        let service = self
            .resolver
            .resolve(namespace, &rule.application)
            .await?
            .ok_or_else(|| {
                Error::derivation_for(
                    input.name,
                    format!(
                        "outbound rule references service {namespace}/{} which does not exist",
                        rule.application
                    ),
                )
            })?;

        let ports = if rule.ports.is_empty() {
            service_target_ports(&service)
        } else {
            rule_ports(rule)
        };

        Ok(NetworkPolicyEgressRule {
            to: Some(vec![rule_peer(rule, input.namespace, service_pod_selector(&service, &rule.application))]),
            ports: (!ports.is_empty()).then_some(ports),
        })
    }

    /// Derive the policy admitting a Routing's gateway to one target application
    pub fn routing_policy(
        &self,
        routing: &str,
        namespace: &str,
        hostname: &Hostname,
        target_app: &str,
        target_ports: &[i32],
    ) -> Result<NetworkPolicy> {
        let ingress = vec![NetworkPolicyIngressRule {
            from: Some(vec![self.gateway_peer(ingress_gateway_for(hostname.internal))]),
            ports: Some(target_ports.iter().copied().map(tcp_port).collect()),
        }];
        Ok(build_policy(
            &routing_policy_name(routing, target_app),
            namespace,
            app_selector(target_app),
            ingress,
            Vec::new(),
        ))
    }

    fn gateway_peer(&self, gateway: &str) -> NetworkPolicyPeer {
        NetworkPolicyPeer {
            namespace_selector: Some(namespace_by_name(&self.config.gateway_namespace)),
            pod_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    GATEWAY_SELECTOR_KEY.to_string(),
                    gateway.to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Name of the policy admitting a Routing's gateway to a target application
pub fn routing_policy_name(routing: &str, target_app: &str) -> String {
    derived_name(routing, ROUTING, target_app)
}

/// Target port on the pods behind a Service port.
///
/// `requested` selects a Service port by number; without it the first port is
/// used. Returns `(service port, target port)`.
pub fn resolve_service_port(service: &Service, requested: Option<i32>) -> Option<(i32, i32)> {
    let ports = service.spec.as_ref()?.ports.as_deref()?;
    let port = match requested {
        Some(number) => ports.iter().find(|p| p.port == number)?,
        None => ports.first()?,
    };
    let target = match &port.target_port {
        Some(IntOrString::Int(t)) => *t,
        _ => port.port,
    };
    Some((port.port, target))
}

// =============================================================================
// Helpers
// =============================================================================

/// Ingress is always isolated; egress only when there are egress rules.
fn build_policy(
    name: &str,
    namespace: &str,
    pod_selector: LabelSelector,
    ingress: Vec<NetworkPolicyIngressRule>,
    egress: Vec<NetworkPolicyEgressRule>,
) -> NetworkPolicy {
    let mut policy_types = vec!["Ingress".to_string()];
    if !egress.is_empty() {
        policy_types.push("Egress".to_string());
    }
    NetworkPolicy {
        metadata: object_meta(name, namespace),
        spec: Some(NetworkPolicySpec {
            pod_selector,
            ingress: Some(ingress),
            egress: (!egress.is_empty()).then_some(egress),
            policy_types: Some(policy_types),
        }),
        ..Default::default()
    }
}

fn app_selector(app: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(APP_LABEL.to_string(), app.to_string())])),
        ..Default::default()
    }
}

fn namespace_by_name(namespace: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(
            NAMESPACE_NAME_LABEL.to_string(),
            namespace.to_string(),
        )])),
        ..Default::default()
    }
}

fn rule_peer(rule: &InternalRule, parent_namespace: &str, pods: LabelSelector) -> NetworkPolicyPeer {
    let namespaces = match &rule.namespaces_by_label {
        Some(labels) => LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        },
        None => namespace_by_name(rule.namespace_or(parent_namespace)),
    };
    NetworkPolicyPeer {
        namespace_selector: Some(namespaces),
        pod_selector: Some(pods),
        ..Default::default()
    }
}

fn tcp_port(port: i32) -> NetworkPolicyPort {
    NetworkPolicyPort {
        port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn rule_ports(rule: &InternalRule) -> Vec<NetworkPolicyPort> {
    rule.ports
        .iter()
        .map(|p| NetworkPolicyPort {
            port: Some(IntOrString::Int(p.port)),
            protocol: Some(p.protocol.clone().unwrap_or_else(|| "TCP".to_string())),
            ..Default::default()
        })
        .collect()
}

fn service_pod_selector(service: &Service, application: &str) -> LabelSelector {
    match service.spec.as_ref().and_then(|s| s.selector.clone()) {
        Some(selector) if !selector.is_empty() => LabelSelector {
            match_labels: Some(selector),
            ..Default::default()
        },
        _ => app_selector(application),
    }
}

fn service_target_ports(service: &Service) -> Vec<NetworkPolicyPort> {
    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or_default();
    ports
        .iter()
        .map(|p| NetworkPolicyPort {
            port: Some(p.target_port.clone().unwrap_or(IntOrString::Int(p.port))),
            protocol: Some(p.protocol.clone().unwrap_or_else(|| "TCP".to_string())),
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use mockall::predicate::eq;
    use skiperator_common::crd::{ExternalPort, ExternalRule, InboundPolicy, OutboundPolicy};

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn service(app: &str, port: i32, target: i32) -> Service {
        Service {
            metadata: object_meta(app, "team-b"),
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([(APP_LABEL.to_string(), app.to_string())])),
                ports: Some(vec![ServicePort {
                    port,
                    target_port: Some(IntOrString::Int(target)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn hostname(host: &str, config: &OperatorConfig) -> Hostname {
        Hostname::parse(host, config).unwrap()
    }

    fn peer_labels(peer: &NetworkPolicyPeer) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        (
            peer.namespace_selector
                .as_ref()
                .and_then(|s| s.match_labels.clone())
                .unwrap_or_default(),
            peer.pod_selector
                .as_ref()
                .and_then(|s| s.match_labels.clone())
                .unwrap_or_default(),
        )
    }

    fn input<'a>(hostnames: &'a [Hostname], policy: Option<&'a AccessPolicy>) -> PolicyInput<'a> {
        PolicyInput {
            name: "my-app",
            namespace: "team-a",
            port: Some(8080),
            hostnames,
            access_policy: policy,
            metrics_port: None,
        }
    }

    // =========================================================================
    // Ingress
    // =========================================================================

    /// Story: an internal hostname admits the internal ingress gateway on the container port
    #[tokio::test]
    async fn story_internal_hostname_selects_internal_gateway() {
        let config = OperatorConfig::default();
        let resolver = MockServiceResolver::new();
        let hosts = vec![hostname("my-app.dev.skip.internal", &config)];
        let compiler = NetworkPolicyCompiler::new(&config, &resolver);

        let np = compiler.compile(&input(&hosts, None)).await.unwrap();

        let spec = np.spec.unwrap();
        let ingress = spec.ingress.unwrap();
        assert_eq!(ingress.len(), 1);
        let (ns, pods) = peer_labels(&ingress[0].from.as_ref().unwrap()[0]);
        assert_eq!(ns[NAMESPACE_NAME_LABEL], "istio-gateways");
        assert_eq!(pods["app"], "istio-ingress-internal");
        assert_eq!(
            ingress[0].ports.as_ref().unwrap()[0].port,
            Some(IntOrString::Int(8080))
        );
        assert_eq!(spec.policy_types, Some(vec!["Ingress".to_string()]));
        assert!(spec.egress.is_none());
    }

    /// Story: a workload with no hostnames and no access rules accepts no traffic
    #[tokio::test]
    async fn story_unexposed_workload_denies_all_ingress() {
        let config = OperatorConfig::default();
        let resolver = MockServiceResolver::new();
        let compiler = NetworkPolicyCompiler::new(&config, &resolver);

        let np = compiler.compile(&input(&[], None)).await.unwrap();

        assert_eq!(np.metadata.name.as_deref(), Some("my-app"));
        let spec = np.spec.unwrap();
        assert_eq!(spec.pod_selector.match_labels.unwrap()[APP_LABEL], "my-app");
        assert_eq!(spec.ingress, Some(vec![]));
        assert!(spec.egress.is_none());
        assert_eq!(spec.policy_types, Some(vec!["Ingress".to_string()]));
    }

    #[tokio::test]
    async fn mixed_hostnames_admit_both_gateways() {
        let config = OperatorConfig::default();
        let resolver = MockServiceResolver::new();
        let hosts = vec![
            hostname("a.kartverket.no", &config),
            hostname("a.intern", &config),
        ];
        let compiler = NetworkPolicyCompiler::new(&config, &resolver);

        let np = compiler.compile(&input(&hosts, None)).await.unwrap();

        let gateways: Vec<String> = np
            .spec
            .unwrap()
            .ingress
            .unwrap()
            .iter()
            .map(|r| peer_labels(&r.from.as_ref().unwrap()[0]).1["app"].clone())
            .collect();
        assert_eq!(gateways, vec!["istio-ingress-internal", "istio-ingress-external"]);
    }

    #[tokio::test]
    async fn inbound_rule_defaults_to_parent_namespace() {
        let config = OperatorConfig::default();
        let resolver = MockServiceResolver::new();
        let policy = AccessPolicy {
            inbound: Some(InboundPolicy {
                rules: vec![InternalRule {
                    application: "frontend".to_string(),
                    ..Default::default()
                }],
            }),
            outbound: None,
        };
        let compiler = NetworkPolicyCompiler::new(&config, &resolver);

        let np = compiler.compile(&input(&[], Some(&policy))).await.unwrap();

        let ingress = np.spec.unwrap().ingress.unwrap();
        let (ns, pods) = peer_labels(&ingress[0].from.as_ref().unwrap()[0]);
        assert_eq!(ns[NAMESPACE_NAME_LABEL], "team-a");
        assert_eq!(pods["app"], "frontend");
    }

    #[tokio::test]
    async fn metrics_scraper_is_admitted() {
        let config = OperatorConfig::default();
        let resolver = MockServiceResolver::new();
        let compiler = NetworkPolicyCompiler::new(&config, &resolver);
        let mut input = input(&[], None);
        input.metrics_port = Some(9090);

        let np = compiler.compile(&input).await.unwrap();

        let ingress = np.spec.unwrap().ingress.unwrap();
        let (ns, _) = peer_labels(&ingress[0].from.as_ref().unwrap()[0]);
        assert_eq!(ns[NAMESPACE_NAME_LABEL], "istio-system");
        assert_eq!(ingress[0].ports.as_ref().unwrap().len(), 2);
    }

    // =========================================================================
    // Egress
    // =========================================================================

    /// Story: an outbound rule is resolved to the target Service's pods and target ports
    #[tokio::test]
    async fn story_outbound_rule_resolves_service() {
        let config = OperatorConfig::default();
        let mut resolver = MockServiceResolver::new();
        resolver
            .expect_resolve()
            .with(eq("team-b"), eq("backend"))
            .times(1)
            .returning(|_, _| Ok(Some(service("backend", 80, 8080))));
        let policy = AccessPolicy {
            inbound: None,
            outbound: Some(OutboundPolicy {
                rules: vec![InternalRule {
                    application: "backend".to_string(),
                    namespace: Some("team-b".to_string()),
                    ..Default::default()
                }],
                external: vec![],
            }),
        };
        let compiler = NetworkPolicyCompiler::new(&config, &resolver);

        let np = compiler.compile(&input(&[], Some(&policy))).await.unwrap();

        let spec = np.spec.unwrap();
        assert_eq!(
            spec.policy_types,
            Some(vec!["Ingress".to_string(), "Egress".to_string()])
        );
        let egress = spec.egress.unwrap();
        let (ns, pods) = peer_labels(&egress[0].to.as_ref().unwrap()[0]);
        assert_eq!(ns[NAMESPACE_NAME_LABEL], "team-b");
        assert_eq!(pods["app"], "backend");
        assert_eq!(
            egress[0].ports.as_ref().unwrap()[0].port,
            Some(IntOrString::Int(8080))
        );
    }

    #[tokio::test]
    async fn missing_service_is_a_derivation_error() {
        let config = OperatorConfig::default();
        let mut resolver = MockServiceResolver::new();
        resolver.expect_resolve().returning(|_, _| Ok(None));
        let policy = AccessPolicy {
            inbound: None,
            outbound: Some(OutboundPolicy {
                rules: vec![InternalRule {
                    application: "ghost".to_string(),
                    ..Default::default()
                }],
                external: vec![],
            }),
        };
        let compiler = NetworkPolicyCompiler::new(&config, &resolver);

        let err = compiler.compile(&input(&[], Some(&policy))).await.unwrap_err();

        assert!(matches!(err, Error::Derivation { ref parent, .. } if parent == "my-app"));
        assert!(err.to_string().contains("team-a/ghost"));
    }

    #[tokio::test]
    async fn namespace_label_rules_skip_resolution() {
        let config = OperatorConfig::default();
        let resolver = MockServiceResolver::new();
        let policy = AccessPolicy {
            inbound: None,
            outbound: Some(OutboundPolicy {
                rules: vec![InternalRule {
                    application: "backend".to_string(),
                    namespaces_by_label: Some(BTreeMap::from([("team".to_string(), "b".to_string())])),
                    ..Default::default()
                }],
                external: vec![],
            }),
        };
        let compiler = NetworkPolicyCompiler::new(&config, &resolver);

        let np = compiler.compile(&input(&[], Some(&policy))).await.unwrap();

        let egress = np.spec.unwrap().egress.unwrap();
        let (ns, _) = peer_labels(&egress[0].to.as_ref().unwrap()[0]);
        assert_eq!(ns["team"], "b");
        assert!(egress[0].ports.is_none());
    }

    #[tokio::test]
    async fn external_ports_are_deduplicated_towards_egress_gateway() {
        let config = OperatorConfig::default();
        let resolver = MockServiceResolver::new();
        let policy = AccessPolicy {
            inbound: None,
            outbound: Some(OutboundPolicy {
                rules: vec![],
                external: vec![
                    ExternalRule {
                        host: "a.com".to_string(),
                        ..Default::default()
                    },
                    ExternalRule {
                        host: "b.com".to_string(),
                        ip: None,
                        ports: vec![ExternalPort {
                            name: "http".to_string(),
                            port: 80,
                            protocol: "HTTP".to_string(),
                        }],
                    },
                    ExternalRule {
                        host: "c.com".to_string(),
                        ..Default::default()
                    },
                ],
            }),
        };
        let compiler = NetworkPolicyCompiler::new(&config, &resolver);

        let np = compiler.compile(&input(&[], Some(&policy))).await.unwrap();

        let egress = np.spec.unwrap().egress.unwrap();
        let ports: Vec<Option<IntOrString>> = egress
            .iter()
            .map(|r| r.ports.as_ref().unwrap()[0].port.clone())
            .collect();
        assert_eq!(ports, vec![Some(IntOrString::Int(80)), Some(IntOrString::Int(443))]);
        let (_, pods) = peer_labels(&egress[0].to.as_ref().unwrap()[0]);
        assert_eq!(pods["app"], "istio-egressgateway");
    }

    // =========================================================================
    // Routing
    // =========================================================================

    #[test]
    fn routing_policy_targets_application_pods() {
        let config = OperatorConfig::default();
        let resolver = MockServiceResolver::new();
        let compiler = NetworkPolicyCompiler::new(&config, &resolver);
        let host = hostname("kartverket.no", &config);

        let np = compiler
            .routing_policy("web", "team-a", &host, "backend", &[8080])
            .unwrap();

        assert_eq!(np.metadata.name, Some(routing_policy_name("web", "backend")));
        let spec = np.spec.unwrap();
        let ingress = spec.ingress.unwrap();
        assert_eq!(peer_labels(&ingress[0].from.as_ref().unwrap()[0]).1["app"], "istio-ingress-external");
    }

    #[test]
    fn service_port_resolution_prefers_requested_port() {
        let svc = service("backend", 80, 8080);
        assert_eq!(resolve_service_port(&svc, None), Some((80, 8080)));
        assert_eq!(resolve_service_port(&svc, Some(80)), Some((80, 8080)));
        assert_eq!(resolve_service_port(&svc, Some(81)), None);
    }
}
