//! Per-hostname ingress steps shared by Application and Routing
//!
//! Both parents derive the same three kinds per hostname. How the objects are
//! derived differs (a Routing resolves its targets first), so each parent
//! supplies an [`IngressDeriver`] and the steps only sync and collect.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use skiperator_common::naming::INGRESS;
use skiperator_common::resources::cert_manager::Certificate;
use skiperator_common::resources::istio::{Gateway, VirtualService};
use skiperator_common::{Result, SkiperatorStatus};
use skiperator_network::IngressObjects;
use skiperator_reconcile::ownership::{cross_namespace_selector, tag, tag_cross_namespace};
use skiperator_reconcile::{OrphanScope, Parent, ReconcileStep, StepFinalizer, StepOutcome};
use tracing::info;

use crate::parent::ParentIdentity;
use crate::steps::StepContext;

/// Derives a parent's ingress objects
#[async_trait]
pub trait IngressDeriver<P>: Send + Sync {
    /// Desired Gateways, VirtualServices and Certificates
    async fn derive(&self, parent: &P) -> Result<IngressObjects>;
}

/// Prefix shared by the Certificates of one parent
pub fn certificate_prefix(id: &ParentIdentity) -> String {
    format!("{}-{}", id.namespace, id.name)
}

/// Certificates in the gateway namespace, tagged with parent labels
pub struct CertificateStep<P> {
    ctx: Arc<StepContext>,
    deriver: Arc<dyn IngressDeriver<P>>,
}

impl<P: Parent> CertificateStep<P> {
    /// Create the step
    pub fn new(ctx: Arc<StepContext>, deriver: Arc<dyn IngressDeriver<P>>) -> Self {
        Self { ctx, deriver }
    }
}

#[async_trait]
impl<P: Parent> ReconcileStep<P> for CertificateStep<P> {
    fn name(&self) -> &'static str {
        "Certificate"
    }

    async fn reconcile(&self, parent: &P, _status: &mut SkiperatorStatus) -> Result<StepOutcome> {
        let id = ParentIdentity::of(parent)?;
        let objects = self.deriver.derive(parent).await?;

        let mut desired = BTreeSet::new();
        for mut cert in objects.certificates {
            tag_cross_namespace(parent, &mut cert);
            desired.insert(cert.name_any());
            self.ctx.sync.sync(cert).await?;
        }

        let selector = cross_namespace_selector(parent);
        let prefix = certificate_prefix(&id);
        let scope = OrphanScope {
            namespace: &self.ctx.config.gateway_namespace,
            owner_uid: None,
            selector: Some(&selector),
            parent: &prefix,
            discriminator: INGRESS,
        };
        self.ctx
            .sync
            .collect_orphans::<Certificate>(&scope, &desired)
            .await?;
        Ok(StepOutcome::Synced)
    }
}

/// One Gateway per hostname
pub struct GatewayStep<P> {
    ctx: Arc<StepContext>,
    deriver: Arc<dyn IngressDeriver<P>>,
}

impl<P: Parent> GatewayStep<P> {
    /// Create the step
    pub fn new(ctx: Arc<StepContext>, deriver: Arc<dyn IngressDeriver<P>>) -> Self {
        Self { ctx, deriver }
    }
}

#[async_trait]
impl<P: Parent> ReconcileStep<P> for GatewayStep<P> {
    fn name(&self) -> &'static str {
        "Gateway"
    }

    async fn reconcile(&self, parent: &P, _status: &mut SkiperatorStatus) -> Result<StepOutcome> {
        let id = ParentIdentity::of(parent)?;
        let objects = self.deriver.derive(parent).await?;

        let mut desired = BTreeSet::new();
        for mut gateway in objects.gateways {
            tag(parent, &mut gateway)?;
            desired.insert(gateway.name_any());
            self.ctx.sync.sync(gateway).await?;
        }
        collect_in_namespace::<Gateway>(&self.ctx, &id, &desired).await?;
        Ok(StepOutcome::Synced)
    }
}

/// One VirtualService per hostname
pub struct VirtualServiceStep<P> {
    ctx: Arc<StepContext>,
    deriver: Arc<dyn IngressDeriver<P>>,
}

impl<P: Parent> VirtualServiceStep<P> {
    /// Create the step
    pub fn new(ctx: Arc<StepContext>, deriver: Arc<dyn IngressDeriver<P>>) -> Self {
        Self { ctx, deriver }
    }
}

#[async_trait]
impl<P: Parent> ReconcileStep<P> for VirtualServiceStep<P> {
    fn name(&self) -> &'static str {
        "VirtualService"
    }

    async fn reconcile(&self, parent: &P, _status: &mut SkiperatorStatus) -> Result<StepOutcome> {
        let id = ParentIdentity::of(parent)?;
        let objects = self.deriver.derive(parent).await?;

        let mut desired = BTreeSet::new();
        for mut vs in objects.virtual_services {
            tag(parent, &mut vs)?;
            desired.insert(vs.name_any());
            self.ctx.sync.sync(vs).await?;
        }
        collect_in_namespace::<VirtualService>(&self.ctx, &id, &desired).await?;
        Ok(StepOutcome::Synced)
    }
}

async fn collect_in_namespace<K>(
    ctx: &StepContext,
    id: &ParentIdentity,
    desired: &BTreeSet<String>,
) -> Result<()>
where
    K: kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::de::DeserializeOwned,
{
    let scope = OrphanScope {
        namespace: &id.namespace,
        owner_uid: Some(&id.uid),
        selector: None,
        parent: &id.name,
        discriminator: INGRESS,
    };
    ctx.sync.collect_orphans::<K>(&scope, desired).await?;
    Ok(())
}

/// Deletes a parent's Certificates, which owner references cannot cover
pub struct CertificateFinalizer {
    ctx: Arc<StepContext>,
}

impl CertificateFinalizer {
    /// Create the finalizer
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl<P: Parent> StepFinalizer<P> for CertificateFinalizer {
    async fn finalize(&self, parent: &P) -> Result<()> {
        let selector = cross_namespace_selector(parent);
        let namespace = &self.ctx.config.gateway_namespace;
        let certificates: Vec<Certificate> =
            self.ctx.sync.list(namespace, Some(&selector)).await?;

        for cert in &certificates {
            self.ctx
                .sync
                .delete::<Certificate>(namespace, &cert.name_any())
                .await?;
        }
        if !certificates.is_empty() {
            info!(
                parent = %parent.name_any(),
                count = certificates.len(),
                "released certificates"
            );
        }
        Ok(())
    }
}
