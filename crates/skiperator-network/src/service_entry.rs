//! ServiceEntry derivation for external egress
//!
//! Every external rule of an access policy becomes one ServiceEntry named
//! `<parent>-egress-<hash16(host)>`, exported only to the parent's namespace.

use std::collections::BTreeSet;

use skiperator_common::crd::ExternalRule;
use skiperator_common::kube_utils::object_meta;
use skiperator_common::naming::egress_name;
use skiperator_common::resources::istio::{ServiceEntry, ServiceEntrySpec, ServicePort, WorkloadEntry};
use skiperator_common::{Error, Result};
use tracing::warn;

/// Location of every egress ServiceEntry
pub const MESH_EXTERNAL: &str = "MESH_EXTERNAL";

/// Protocols accepted on external ports
pub const ALLOWED_PROTOCOLS: [&str; 3] = ["HTTP", "HTTPS", "TCP"];

/// Port used when an external rule lists none
pub fn default_port() -> ServicePort {
    ServicePort {
        number: 443,
        name: "https".to_string(),
        protocol: "HTTPS".to_string(),
    }
}

/// Ports of an external rule after defaulting and validation.
///
/// TCP ports are only routable by IP; without one they are dropped.
pub fn effective_ports(rule: &ExternalRule) -> Result<Vec<ServicePort>> {
    if rule.ports.is_empty() {
        return Ok(vec![default_port()]);
    }

    let mut ports = Vec::with_capacity(rule.ports.len());
    for port in &rule.ports {
        if !ALLOWED_PROTOCOLS.contains(&port.protocol.as_str()) {
            return Err(Error::derivation(format!(
                "external host {} uses unsupported protocol {:?} on port {}",
                rule.host, port.protocol, port.port
            )));
        }
        if port.protocol == "TCP" && rule.ip.is_none() {
            warn!(host = %rule.host, port = port.port, "dropping TCP port on external host without ip");
            continue;
        }
        ports.push(ServicePort {
            number: port.port,
            name: port.name.clone(),
            protocol: port.protocol.clone(),
        });
    }
    Ok(ports)
}

/// Derive the ServiceEntries for a parent's external rules.
///
/// Later rules for an already seen host are ignored. A rule whose every port
/// was dropped produces no ServiceEntry.
pub fn service_entries(
    parent: &str,
    namespace: &str,
    rules: &[ExternalRule],
) -> Result<Vec<ServiceEntry>> {
    let mut seen = BTreeSet::new();
    let mut entries = Vec::with_capacity(rules.len());

    for rule in rules {
        if rule.host.is_empty() {
            return Err(Error::derivation_for(parent, "external rule without host"));
        }
        if !seen.insert(rule.host.as_str()) {
            warn!(host = %rule.host, "duplicate external host, keeping first rule");
            continue;
        }

        let ports = effective_ports(rule).map_err(|e| match e {
            Error::Derivation { message, .. } => Error::derivation_for(parent, message),
            other => other,
        })?;
        if ports.is_empty() {
            continue;
        }

        let (resolution, endpoints) = match &rule.ip {
            Some(ip) => (
                "STATIC",
                vec![WorkloadEntry {
                    address: ip.clone(),
                }],
            ),
            None => ("DNS", Vec::new()),
        };

        entries.push(ServiceEntry {
            metadata: object_meta(egress_name(parent, &rule.host), namespace),
            spec: ServiceEntrySpec {
                hosts: vec![rule.host.clone()],
                export_to: vec![".".to_string()],
                ports,
                location: MESH_EXTERNAL.to_string(),
                resolution: resolution.to_string(),
                endpoints,
            },
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;
    use skiperator_common::crd::ExternalPort;

    fn rule(host: &str, ip: Option<&str>, ports: Vec<(&str, i32, &str)>) -> ExternalRule {
        ExternalRule {
            host: host.to_string(),
            ip: ip.map(String::from),
            ports: ports
                .into_iter()
                .map(|(name, port, protocol)| ExternalPort {
                    name: name.to_string(),
                    port,
                    protocol: protocol.to_string(),
                })
                .collect(),
        }
    }

    /// Story: an HTTP dependency on example.com:80 becomes a DNS resolved entry
    #[test]
    fn story_http_dependency_on_port_80() {
        let rules = vec![rule("example.com", None, vec![("http", 80, "HTTP")])];
        let entries = service_entries("my-app", "team-a", &rules).unwrap();

        assert_eq!(entries.len(), 1);
        let se = &entries[0];
        assert_eq!(se.name_any(), egress_name("my-app", "example.com"));
        assert_eq!(se.namespace().as_deref(), Some("team-a"));
        assert_eq!(se.spec.hosts, vec!["example.com"]);
        assert_eq!(se.spec.resolution, "DNS");
        assert_eq!(se.spec.location, MESH_EXTERNAL);
        assert_eq!(se.spec.export_to, vec!["."]);
        assert!(se.spec.endpoints.is_empty());
        assert_eq!(
            se.spec.ports,
            vec![ServicePort {
                number: 80,
                name: "http".to_string(),
                protocol: "HTTP".to_string()
            }]
        );
    }

    #[test]
    fn portless_rule_defaults_to_https() {
        let entries = service_entries("a", "ns", &[rule("api.example.com", None, vec![])]).unwrap();
        assert_eq!(entries[0].spec.ports, vec![default_port()]);
    }

    #[test]
    fn ip_makes_resolution_static() {
        let entries = service_entries(
            "a",
            "ns",
            &[rule("db.example.com", Some("10.0.0.5"), vec![("db", 5432, "TCP")])],
        )
        .unwrap();
        assert_eq!(entries[0].spec.resolution, "STATIC");
        assert_eq!(entries[0].spec.endpoints[0].address, "10.0.0.5");
        assert_eq!(entries[0].spec.ports[0].protocol, "TCP");
    }

    #[test]
    fn tcp_without_ip_is_dropped() {
        let rules = vec![
            rule("mixed.example.com", None, vec![("db", 5432, "TCP"), ("https", 443, "HTTPS")]),
            rule("tcp-only.example.com", None, vec![("db", 5432, "TCP")]),
        ];
        let entries = service_entries("a", "ns", &rules).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].spec.ports.len(), 1);
        assert_eq!(entries[0].spec.ports[0].number, 443);
    }

    #[test]
    fn unknown_protocol_is_a_derivation_error() {
        let err = service_entries("a", "ns", &[rule("x.com", None, vec![("grpc", 9000, "GRPC")])])
            .unwrap_err();
        assert!(matches!(err, Error::Derivation { .. }));
        assert!(err.to_string().contains("GRPC"));
    }

    #[test]
    fn duplicate_hosts_yield_one_entry() {
        let rules = vec![rule("x.com", None, vec![]), rule("x.com", None, vec![("http", 80, "HTTP")])];
        let entries = service_entries("a", "ns", &rules).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].spec.ports, vec![default_port()]);
    }
}
