//! AccessPolicy: declared inbound and outbound traffic for a workload
//!
//! The policy is pure input; derivation turns it into a NetworkPolicy and
//! ServiceEntries and never writes back to it.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Inbound and outbound traffic rules for a workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicy {
    /// Workloads allowed to call this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound: Option<InboundPolicy>,

    /// Workloads and external hosts this one may call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound: Option<OutboundPolicy>,
}

impl AccessPolicy {
    /// Inbound rules, empty when none are declared
    pub fn inbound_rules(&self) -> &[InternalRule] {
        self.inbound.as_ref().map(|i| i.rules.as_slice()).unwrap_or_default()
    }

    /// Outbound internal rules, empty when none are declared
    pub fn outbound_rules(&self) -> &[InternalRule] {
        self.outbound.as_ref().map(|o| o.rules.as_slice()).unwrap_or_default()
    }

    /// Outbound external rules, empty when none are declared
    pub fn external_rules(&self) -> &[ExternalRule] {
        self.outbound
            .as_ref()
            .map(|o| o.external.as_slice())
            .unwrap_or_default()
    }
}

/// Inbound half of an access policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct InboundPolicy {
    /// Allowed callers
    #[serde(default)]
    pub rules: Vec<InternalRule>,
}

/// Outbound half of an access policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct OutboundPolicy {
    /// In-cluster workloads this one may call
    #[serde(default)]
    pub rules: Vec<InternalRule>,

    /// External hosts this one may call
    #[serde(default)]
    pub external: Vec<ExternalRule>,
}

/// A peer workload inside the cluster
///
/// `namespace` and `namespacesByLabel` are alternative ways of locating the
/// peer's namespace. With neither set the peer lives in the parent's namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InternalRule {
    /// Name of the peer application (its `app` pod label)
    pub application: String,

    /// Namespace of the peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Label selector for the peer's namespaces
    #[serde(
        default,
        alias = "namespaceSelector",
        skip_serializing_if = "Option::is_none"
    )]
    pub namespaces_by_label: Option<BTreeMap<String, String>>,

    /// Explicit ports, used when the peer's Service cannot be resolved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<InternalPort>,
}

impl InternalRule {
    /// The peer's namespace, defaulting to the parent's
    pub fn namespace_or<'a>(&'a self, parent_namespace: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => parent_namespace,
        }
    }
}

/// A port on an internal peer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct InternalPort {
    /// Port number
    pub port: i32,

    /// Transport protocol (TCP or UDP), TCP when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// An external host the workload may call
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ExternalRule {
    /// DNS name of the host
    pub host: String,

    /// Static IP; without one the host is resolved through DNS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Ports on the host; HTTPS on 443 when empty
    #[serde(default)]
    pub ports: Vec<ExternalPort>,
}

/// A port on an external host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ExternalPort {
    /// Port name
    pub name: String,

    /// Port number
    pub port: i32,

    /// One of HTTP, HTTPS or TCP
    pub protocol: String,
}
