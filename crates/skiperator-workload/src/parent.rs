//! Workload parents: the parent kinds that run pods

use kube::ResourceExt;
use skiperator_common::crd::{AccessPolicy, Application, GcpSettings, SkipJob};
use skiperator_common::{Error, Result};
use skiperator_reconcile::Parent;

/// A parent that runs a workload with an access policy
pub trait WorkloadParent: Parent {
    /// Declared traffic
    fn access_policy(&self) -> Option<&AccessPolicy>;

    /// GCP workload identity settings
    fn gcp(&self) -> Option<&GcpSettings>;

    /// Main container port, if the workload serves traffic
    fn container_port(&self) -> Option<i32>;

    /// Raw ingress hostnames
    fn ingress_hosts(&self) -> &[String];

    /// Port scraped for metrics
    fn metrics_port(&self) -> Option<i32>;
}

impl WorkloadParent for Application {
    fn access_policy(&self) -> Option<&AccessPolicy> {
        self.spec.access_policy.as_ref()
    }

    fn gcp(&self) -> Option<&GcpSettings> {
        self.spec.gcp.as_ref()
    }

    fn container_port(&self) -> Option<i32> {
        Some(self.spec.port)
    }

    fn ingress_hosts(&self) -> &[String] {
        &self.spec.ingresses
    }

    fn metrics_port(&self) -> Option<i32> {
        self.spec.prometheus.as_ref().map(|p| p.port)
    }
}

impl WorkloadParent for SkipJob {
    fn access_policy(&self) -> Option<&AccessPolicy> {
        self.spec.container.access_policy.as_ref()
    }

    fn gcp(&self) -> Option<&GcpSettings> {
        self.spec.container.gcp.as_ref()
    }

    fn container_port(&self) -> Option<i32> {
        None
    }

    fn ingress_hosts(&self) -> &[String] {
        &[]
    }

    fn metrics_port(&self) -> Option<i32> {
        self.spec.prometheus.as_ref().map(|p| p.port)
    }
}

/// Name, namespace and UID of a persisted parent
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentIdentity {
    /// Parent name
    pub name: String,
    /// Parent namespace
    pub namespace: String,
    /// Parent UID
    pub uid: String,
}

impl ParentIdentity {
    /// Identity of a parent read from the cluster; fails for parents that were
    /// never persisted
    pub fn of<P: Parent>(parent: &P) -> Result<Self> {
        let name = parent.name_any();
        let namespace = parent
            .namespace()
            .ok_or_else(|| Error::derivation_for(&name, "parent has no namespace"))?;
        let uid = parent
            .uid()
            .ok_or_else(|| Error::derivation_for(&name, "parent has no uid"))?;
        Ok(Self { name, namespace, uid })
    }
}
