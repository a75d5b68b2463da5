//! Ingress derivation: Gateway, VirtualService and Certificate per hostname
//!
//! Each distinct hostname of a parent gets a Gateway and a VirtualService
//! named `<parent>-ingress-<hash16(host)>` in the parent's namespace. Hostnames
//! without a custom secret also get a cert-manager Certificate in the gateway
//! namespace, whose secret the Gateway's HTTPS server references.

use std::collections::BTreeMap;

use skiperator_common::kube_utils::object_meta;
use skiperator_common::mesh::{ingress_gateway_for, GATEWAY_SELECTOR_KEY};
use skiperator_common::resources::cert_manager::{Certificate, CertificateSpec, IssuerRef};
use skiperator_common::resources::istio::{
    Destination, Gateway, GatewayPort, GatewaySpec, HttpMatchRequest, HttpRewrite, HttpRoute,
    HttpRouteDestination, PortSelector, Server, ServerTls, StringMatch, VirtualService,
    VirtualServiceSpec,
};
use skiperator_common::OperatorConfig;

use crate::hosts::{generated_secret_name, Hostname};

/// Kind of the issuer signing ingress certificates
pub const CLUSTER_ISSUER_KIND: &str = "ClusterIssuer";

/// One path prefix of a Routing, resolved to a Service port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteTarget {
    /// Matched URI prefix
    pub path_prefix: String,
    /// Target application (and Service) name
    pub app: String,
    /// Service port traffic is sent to
    pub port: i32,
    /// Strip the prefix before forwarding
    pub rewrite_uri: bool,
}

/// Ingress objects for one parent
#[derive(Clone, Debug, Default)]
pub struct IngressObjects {
    /// Gateways in the parent namespace
    pub gateways: Vec<Gateway>,
    /// VirtualServices in the parent namespace
    pub virtual_services: Vec<VirtualService>,
    /// Certificates in the gateway namespace
    pub certificates: Vec<Certificate>,
}

/// Derives per-hostname ingress objects
pub struct IngressCompiler<'a> {
    config: &'a OperatorConfig,
}

impl<'a> IngressCompiler<'a> {
    /// Create a compiler for the given operator configuration
    pub fn new(config: &'a OperatorConfig) -> Self {
        Self { config }
    }

    /// Derive the ingress of an Application serving on `port`
    pub fn compile_application(
        &self,
        parent: &str,
        namespace: &str,
        hostnames: &[Hostname],
        port: i32,
        redirect_to_https: bool,
    ) -> IngressObjects {
        let mut objects = IngressObjects::default();
        for host in hostnames {
            objects
                .gateways
                .push(self.gateway(parent, namespace, host, redirect_to_https));
            objects.virtual_services.push(self.virtual_service(
                parent,
                namespace,
                host,
                vec![HttpRoute {
                    name: Some("default-app-route".to_string()),
                    route: vec![destination(parent, port)],
                    ..Default::default()
                }],
            ));
            objects
                .certificates
                .extend(self.certificate(parent, namespace, host));
        }
        objects
    }

    /// Derive the ingress of a Routing
    pub fn compile_routing(
        &self,
        routing: &str,
        namespace: &str,
        hostname: &Hostname,
        routes: &[RouteTarget],
        redirect_to_https: bool,
    ) -> IngressObjects {
        let http = routes
            .iter()
            .map(|r| HttpRoute {
                name: Some(r.app.clone()),
                match_: vec![HttpMatchRequest {
                    uri: Some(StringMatch {
                        prefix: Some(r.path_prefix.clone()),
                    }),
                }],
                rewrite: r.rewrite_uri.then(|| HttpRewrite {
                    uri: "/".to_string(),
                }),
                route: vec![destination(&r.app, r.port)],
            })
            .collect();

        IngressObjects {
            gateways: vec![self.gateway(routing, namespace, hostname, redirect_to_https)],
            virtual_services: vec![self.virtual_service(routing, namespace, hostname, http)],
            certificates: self
                .certificate(routing, namespace, hostname)
                .into_iter()
                .collect(),
        }
    }

    /// Gateway with an HTTP server on 80 and an HTTPS server on 443
    pub fn gateway(
        &self,
        parent: &str,
        namespace: &str,
        host: &Hostname,
        redirect_to_https: bool,
    ) -> Gateway {
        let http = Server {
            port: GatewayPort {
                number: 80,
                name: "http".to_string(),
                protocol: "HTTP".to_string(),
            },
            hosts: vec![host.host.clone()],
            tls: redirect_to_https.then(|| ServerTls {
                https_redirect: Some(true),
                ..Default::default()
            }),
        };
        let https = Server {
            port: GatewayPort {
                number: 443,
                name: "https".to_string(),
                protocol: "HTTPS".to_string(),
            },
            hosts: vec![host.host.clone()],
            tls: Some(ServerTls {
                mode: Some("SIMPLE".to_string()),
                credential_name: Some(host.credential_name(parent, namespace)),
                ..Default::default()
            }),
        };

        Gateway {
            metadata: object_meta(host.object_name(parent), namespace),
            spec: GatewaySpec {
                selector: BTreeMap::from([(
                    GATEWAY_SELECTOR_KEY.to_string(),
                    ingress_gateway_for(host.internal).to_string(),
                )]),
                servers: vec![http, https],
            },
        }
    }

    fn virtual_service(
        &self,
        parent: &str,
        namespace: &str,
        host: &Hostname,
        http: Vec<HttpRoute>,
    ) -> VirtualService {
        let name = host.object_name(parent);
        VirtualService {
            metadata: object_meta(&name, namespace),
            spec: VirtualServiceSpec {
                hosts: vec![host.host.clone()],
                gateways: vec![name],
                export_to: vec![".".to_string(), self.config.gateway_namespace.clone()],
                http,
            },
        }
    }

    /// Certificate for a hostname, `None` when a custom secret is used
    pub fn certificate(&self, parent: &str, namespace: &str, host: &Hostname) -> Option<Certificate> {
        if host.custom_secret.is_some() {
            return None;
        }
        let name = generated_secret_name(parent, namespace, &host.host);
        Some(Certificate {
            metadata: object_meta(&name, &self.config.gateway_namespace),
            spec: CertificateSpec {
                secret_name: name,
                dns_names: vec![host.host.clone()],
                issuer_ref: IssuerRef {
                    name: self.config.cluster_issuer.clone(),
                    kind: CLUSTER_ISSUER_KIND.to_string(),
                },
            },
        })
    }
}

fn destination(host: &str, port: i32) -> HttpRouteDestination {
    HttpRouteDestination {
        destination: Destination {
            host: host.to_string(),
            port: Some(PortSelector { number: port }),
        },
    }
}
