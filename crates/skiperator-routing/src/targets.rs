//! Resolves the routes of a Routing against the target applications' Services

use std::collections::BTreeMap;

use kube::ResourceExt;
use skiperator_common::crd::Routing;
use skiperator_common::{Error, Result};
use skiperator_network::{resolve_service_port, RouteTarget, ServiceResolver};

/// Routes with their Service ports, plus the pod ports each application
/// must admit from the gateway
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedRoutes {
    /// One entry per route, in declaration order
    pub targets: Vec<RouteTarget>,
    /// Target application to the container ports behind its routed Service ports
    pub pod_ports: BTreeMap<String, Vec<i32>>,
}

/// Look up every route's Service.
///
/// A missing Service or a port the Service does not expose is a derivation
/// error: the Routing cannot be expressed until the application exists.
pub async fn resolve_routes(routing: &Routing, resolver: &dyn ServiceResolver) -> Result<ResolvedRoutes> {
    let name = routing.name_any();
    let namespace = routing.namespace().unwrap_or_default();
    let mut resolved = ResolvedRoutes::default();

    for route in &routing.spec.routes {
        let service = resolver
            .resolve(&namespace, &route.target_app)
            .await?
            .ok_or_else(|| {
                Error::derivation_for(
                    &name,
                    format!("target application {} has no Service", route.target_app),
                )
            })?;
        let (port, target_port) = resolve_service_port(&service, route.port).ok_or_else(|| {
            let requested = route
                .port
                .map_or_else(|| "any port".to_string(), |p| format!("port {p}"));
            Error::derivation_for(
                &name,
                format!("Service {} does not expose {requested}", route.target_app),
            )
        })?;

        resolved.targets.push(RouteTarget {
            path_prefix: route.path_prefix.clone(),
            app: route.target_app.clone(),
            port,
            rewrite_uri: route.rewrite_uri,
        });
        let ports = resolved.pod_ports.entry(route.target_app.clone()).or_default();
        if !ports.contains(&target_port) {
            ports.push(target_port);
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use mockall::mock;
    use mockall::predicate::eq;
    use skiperator_common::crd::{Route, RoutingSpec};

    mock! {
        pub Resolver {}

        #[async_trait]
        impl ServiceResolver for Resolver {
            async fn resolve(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
        }
    }

    fn service(ports: &[(i32, i32)]) -> Service {
        Service {
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .iter()
                        .map(|(port, target)| ServicePort {
                            port: *port,
                            target_port: Some(IntOrString::Int(*target)),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn routing(routes: Vec<Route>) -> Routing {
        let mut routing = Routing::new(
            "web",
            RoutingSpec {
                hostname: "web.kartverket.no".to_string(),
                routes,
                redirect_to_https: Some(true),
            },
        );
        routing.metadata.namespace = Some("team-a".to_string());
        routing
    }

    fn route(prefix: &str, app: &str, port: Option<i32>) -> Route {
        Route {
            path_prefix: prefix.to_string(),
            target_app: app.to_string(),
            port,
            rewrite_uri: false,
        }
    }

    /// Story: two prefixes to one app and one to another admit each app's pod port once
    #[tokio::test]
    async fn story_routes_resolve_to_service_ports() {
        let mut resolver = MockResolver::new();
        resolver
            .expect_resolve()
            .with(eq("team-a"), eq("frontend"))
            .returning(|_, _| Ok(Some(service(&[(80, 8080)]))));
        resolver
            .expect_resolve()
            .with(eq("team-a"), eq("api"))
            .returning(|_, _| Ok(Some(service(&[(80, 8080), (9000, 9090)]))));

        let r = routing(vec![
            route("/", "frontend", None),
            route("/static", "frontend", None),
            route("/api", "api", Some(9000)),
        ]);
        let resolved = resolve_routes(&r, &resolver).await.unwrap();

        assert_eq!(resolved.targets.len(), 3);
        assert_eq!(resolved.targets[2].port, 9000);
        assert_eq!(resolved.pod_ports["frontend"], vec![8080]);
        assert_eq!(resolved.pod_ports["api"], vec![9090]);
    }

    #[tokio::test]
    async fn missing_service_is_a_derivation_error() {
        let mut resolver = MockResolver::new();
        resolver.expect_resolve().returning(|_, _| Ok(None));

        let err = resolve_routes(&routing(vec![route("/", "ghost", None)]), &resolver)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn unknown_port_is_a_derivation_error() {
        let mut resolver = MockResolver::new();
        resolver
            .expect_resolve()
            .returning(|_, _| Ok(Some(service(&[(80, 8080)]))));

        let err = resolve_routes(&routing(vec![route("/", "frontend", Some(443))]), &resolver)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("port 443"));
    }
}
