//! Reconcile steps shared by every workload parent

use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, LocalObjectReference, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::Resource;
use skiperator_common::events::{EventPublisher, ParentEvent};
use skiperator_common::kube_utils::object_meta;
use skiperator_common::naming::EGRESS;
use skiperator_common::resources::istio::ServiceEntry;
use skiperator_common::{Error, OperatorConfig, Result, SkiperatorStatus};
use skiperator_network::{
    parse_hostnames, service_entries, NetworkPolicyCompiler, PolicyInput, ServiceResolver,
};
use skiperator_reconcile::ownership::tag;
use skiperator_reconcile::{OrphanScope, ReconcileStep, StepOutcome, Synchronizer};
use tracing::debug;

use crate::gcp;
use crate::parent::{ParentIdentity, WorkloadParent};

/// Everything a step needs from the cluster and the operator
pub struct StepContext {
    /// Writes derived objects
    pub sync: Synchronizer,
    /// Operator configuration
    pub config: Arc<OperatorConfig>,
    /// Resolves outbound Services
    pub resolver: Arc<dyn ServiceResolver>,
    /// Publishes advisory events
    pub events: Arc<dyn EventPublisher>,
}

// =============================================================================
// ServiceAccount
// =============================================================================

/// One ServiceAccount per workload, named after the parent
pub struct ServiceAccountStep<P> {
    ctx: Arc<StepContext>,
    _parent: PhantomData<fn(P)>,
}

impl<P: WorkloadParent> ServiceAccountStep<P> {
    /// Create the step
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self {
            ctx,
            _parent: PhantomData,
        }
    }
}

/// Desired ServiceAccount of a workload
pub fn desired_service_account(id: &ParentIdentity, config: &OperatorConfig) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(&id.name, &id.namespace),
        image_pull_secrets: (!config.image_pull_secrets.is_empty()).then(|| {
            config
                .image_pull_secrets
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl<P: WorkloadParent> ReconcileStep<P> for ServiceAccountStep<P> {
    fn name(&self) -> &'static str {
        "ServiceAccount"
    }

    async fn reconcile(&self, parent: &P, _status: &mut SkiperatorStatus) -> Result<StepOutcome> {
        let id = ParentIdentity::of(parent)?;
        let mut sa = desired_service_account(&id, &self.ctx.config);
        tag(parent, &mut sa)?;
        // Token controller populated fields must survive updates
        self.ctx
            .sync
            .sync_with(sa, |current, desired| {
                desired.secrets = current.secrets.clone();
            })
            .await?;
        Ok(StepOutcome::Synced)
    }
}

// =============================================================================
// GCP auth ConfigMap
// =============================================================================

/// Credential ConfigMap for workloads with GCP workload identity
pub struct GcpAuthConfigMapStep<P> {
    ctx: Arc<StepContext>,
    _parent: PhantomData<fn(P)>,
}

impl<P: WorkloadParent> GcpAuthConfigMapStep<P> {
    /// Create the step
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self {
            ctx,
            _parent: PhantomData,
        }
    }
}

#[async_trait]
impl<P: WorkloadParent> ReconcileStep<P> for GcpAuthConfigMapStep<P> {
    fn name(&self) -> &'static str {
        "GCPAuthConfigMap"
    }

    async fn reconcile(&self, parent: &P, _status: &mut SkiperatorStatus) -> Result<StepOutcome> {
        let id = ParentIdentity::of(parent)?;
        let name = gcp::config_map_name(&id.name);

        let Some(service_account) = parent.gcp().and_then(|g| g.service_account()) else {
            self.ctx
                .sync
                .delete_owned::<ConfigMap>(&id.namespace, &name, &id.uid)
                .await?;
            return Ok(StepOutcome::Synced);
        };

        let identity_ref = &self.ctx.config.gcp_identity_config;
        let Some(identity) = self
            .ctx
            .sync
            .get::<ConfigMap>(&identity_ref.namespace, &identity_ref.name)
            .await?
        else {
            let message = format!(
                "cluster configmap {}/{} is missing",
                identity_ref.namespace, identity_ref.name
            );
            self.ctx
                .events
                .publish(
                    &parent.object_ref(&()),
                    ParentEvent::MissingConfiguration {
                        message: message.clone(),
                    },
                )
                .await;
            return Err(Error::config(message));
        };

        let mut cm = gcp::auth_config_map(
            &id.name,
            &id.namespace,
            service_account,
            &identity,
            identity_ref,
        )?;
        tag(parent, &mut cm)?;
        self.ctx.sync.sync(cm).await?;
        Ok(StepOutcome::Synced)
    }
}

// =============================================================================
// NetworkPolicy
// =============================================================================

/// The workload's NetworkPolicy
pub struct NetworkPolicyStep<P> {
    ctx: Arc<StepContext>,
    _parent: PhantomData<fn(P)>,
}

impl<P: WorkloadParent> NetworkPolicyStep<P> {
    /// Create the step
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self {
            ctx,
            _parent: PhantomData,
        }
    }
}

#[async_trait]
impl<P: WorkloadParent> ReconcileStep<P> for NetworkPolicyStep<P> {
    fn name(&self) -> &'static str {
        "NetworkPolicy"
    }

    async fn reconcile(&self, parent: &P, _status: &mut SkiperatorStatus) -> Result<StepOutcome> {
        let id = ParentIdentity::of(parent)?;
        let hostnames = parse_hostnames(parent.ingress_hosts(), &self.ctx.config)
            .map_err(|e| with_parent(e, &id.name))?;
        let input = PolicyInput {
            name: &id.name,
            namespace: &id.namespace,
            port: parent.container_port(),
            hostnames: &hostnames,
            access_policy: parent.access_policy(),
            metrics_port: parent.metrics_port(),
        };

        let mut policy: NetworkPolicy =
            NetworkPolicyCompiler::new(&self.ctx.config, self.ctx.resolver.as_ref())
                .compile(&input)
                .await?;
        tag(parent, &mut policy)?;
        self.ctx.sync.sync(policy).await?;
        Ok(StepOutcome::Synced)
    }
}

// =============================================================================
// ServiceEntry
// =============================================================================

/// One ServiceEntry per external host, with stale entries collected
pub struct ServiceEntryStep<P> {
    ctx: Arc<StepContext>,
    _parent: PhantomData<fn(P)>,
}

impl<P: WorkloadParent> ServiceEntryStep<P> {
    /// Create the step
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self {
            ctx,
            _parent: PhantomData,
        }
    }
}

#[async_trait]
impl<P: WorkloadParent> ReconcileStep<P> for ServiceEntryStep<P> {
    fn name(&self) -> &'static str {
        "ServiceEntry"
    }

    async fn reconcile(&self, parent: &P, _status: &mut SkiperatorStatus) -> Result<StepOutcome> {
        let id = ParentIdentity::of(parent)?;
        let rules = parent
            .access_policy()
            .map(|p| p.external_rules())
            .unwrap_or_default();

        let entries = service_entries(&id.name, &id.namespace, rules)?;
        let mut desired = BTreeSet::new();
        for mut entry in entries {
            tag(parent, &mut entry)?;
            desired.insert(entry.metadata.name.clone().unwrap_or_default());
            self.ctx.sync.sync(entry).await?;
        }

        let scope = OrphanScope {
            namespace: &id.namespace,
            owner_uid: Some(&id.uid),
            selector: None,
            parent: &id.name,
            discriminator: EGRESS,
        };
        let deleted = self
            .ctx
            .sync
            .collect_orphans::<ServiceEntry>(&scope, &desired)
            .await?;
        debug!(kept = desired.len(), deleted = deleted.len(), "service entries synced");
        Ok(StepOutcome::Synced)
    }
}

// =============================================================================
// One object per parent
// =============================================================================

/// Whether a one-per-parent object should exist
#[derive(Clone, Debug, PartialEq)]
pub enum Desired<K> {
    /// Write this object
    Apply(K),
    /// Delete the named object if the parent owns it
    Remove(String),
}

/// Derives the one-per-parent object of a step
pub type DeriveFn<P, K> = fn(&P, &StepContext) -> Result<Desired<K>>;

/// Copies server-owned fields from the current object onto the desired one
pub type PreserveFn<K> = fn(&K, &mut K);

/// A step syncing (or removing) a single object named after its parent
pub struct OwnedObjectStep<P, K> {
    name: &'static str,
    ctx: Arc<StepContext>,
    derive: DeriveFn<P, K>,
    preserve: PreserveFn<K>,
}

impl<P, K> OwnedObjectStep<P, K> {
    /// Create a step reported under `name`
    pub fn new(name: &'static str, ctx: Arc<StepContext>, derive: DeriveFn<P, K>) -> Self {
        Self {
            name,
            ctx,
            derive,
            preserve: |_, _| {},
        }
    }

    /// Keep server-owned fields across updates
    pub fn preserving(mut self, preserve: PreserveFn<K>) -> Self {
        self.preserve = preserve;
        self
    }
}

#[async_trait]
impl<P, K> ReconcileStep<P> for OwnedObjectStep<P, K>
where
    P: skiperator_reconcile::Parent,
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn reconcile(&self, parent: &P, _status: &mut SkiperatorStatus) -> Result<StepOutcome> {
        match (self.derive)(parent, &self.ctx)? {
            Desired::Apply(mut object) => {
                tag(parent, &mut object)?;
                self.ctx.sync.sync_with(object, self.preserve).await?;
            }
            Desired::Remove(name) => {
                let id = ParentIdentity::of(parent)?;
                if self
                    .ctx
                    .sync
                    .delete_owned::<K>(&id.namespace, &name, &id.uid)
                    .await?
                {
                    debug!(step = self.name, %name, "removed object no longer desired");
                }
            }
        }
        Ok(StepOutcome::Synced)
    }
}

/// Attach the parent name to a derivation error raised without one
pub fn with_parent(err: Error, parent: &str) -> Error {
    match err {
        Error::Derivation { message, .. } => Error::derivation_for(parent, message),
        other => other,
    }
}
