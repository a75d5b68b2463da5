//! Routing controller
//!
//! A Routing exposes one hostname and forwards path prefixes to Applications in
//! its namespace. It shares the per-hostname ingress steps with Application and
//! adds one NetworkPolicy per target application so the gateway can reach it.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use skiperator_common::crd::Routing;
use skiperator_common::naming::ROUTING;
use skiperator_common::{Error, EventPublisher, OperatorConfig, Result, SkiperatorStatus};
use skiperator_network::{
    Hostname, IngressCompiler, IngressObjects, NetworkPolicyCompiler, ServiceResolver,
};
use skiperator_reconcile::ownership::tag;
use skiperator_reconcile::{
    retry_after, Orchestrator, OrphanScope, ParentStore, ReconcileStep, StepOutcome,
};
use skiperator_workload::steps::with_parent;
use skiperator_workload::{
    CertificateFinalizer, CertificateStep, GatewayStep, IngressDeriver, ParentIdentity,
    StepContext, VirtualServiceStep,
};
use tracing::{error, info, instrument};

use crate::targets::resolve_routes;

fn hostname(routing: &Routing, config: &OperatorConfig) -> Result<Hostname> {
    Hostname::parse(&routing.spec.hostname, config).map_err(|e| with_parent(e, &routing.name_any()))
}

/// Ingress objects of a Routing: one Gateway, VirtualService and Certificate
pub struct RoutingIngress {
    config: Arc<OperatorConfig>,
    resolver: Arc<dyn ServiceResolver>,
}

impl RoutingIngress {
    /// Create a deriver resolving targets through `resolver`
    pub fn new(config: Arc<OperatorConfig>, resolver: Arc<dyn ServiceResolver>) -> Self {
        Self { config, resolver }
    }
}

#[async_trait]
impl IngressDeriver<Routing> for RoutingIngress {
    async fn derive(&self, routing: &Routing) -> Result<IngressObjects> {
        let id = ParentIdentity::of(routing)?;
        let host = hostname(routing, &self.config)?;
        let resolved = resolve_routes(routing, self.resolver.as_ref()).await?;
        Ok(IngressCompiler::new(&self.config).compile_routing(
            &id.name,
            &id.namespace,
            &host,
            &resolved.targets,
            routing.spec.redirect_to_https.unwrap_or(true),
        ))
    }
}

/// Admits the Routing's ingress gateway to every target application
pub struct RoutingNetworkPolicyStep {
    ctx: Arc<StepContext>,
}

impl RoutingNetworkPolicyStep {
    /// Create the step
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self { ctx }
    }

    /// Desired policies, one per distinct target application
    pub async fn desired(&self, routing: &Routing) -> Result<Vec<NetworkPolicy>> {
        let id = ParentIdentity::of(routing)?;
        let host = hostname(routing, &self.ctx.config)?;
        let resolved = resolve_routes(routing, self.ctx.resolver.as_ref()).await?;
        let compiler = NetworkPolicyCompiler::new(&self.ctx.config, self.ctx.resolver.as_ref());

        resolved
            .pod_ports
            .iter()
            .map(|(app, ports)| compiler.routing_policy(&id.name, &id.namespace, &host, app, ports))
            .collect()
    }
}

#[async_trait]
impl ReconcileStep<Routing> for RoutingNetworkPolicyStep {
    fn name(&self) -> &'static str {
        "NetworkPolicy"
    }

    async fn reconcile(&self, routing: &Routing, _status: &mut SkiperatorStatus) -> Result<StepOutcome> {
        let id = ParentIdentity::of(routing)?;
        let mut desired = BTreeSet::new();
        for mut policy in self.desired(routing).await? {
            tag(routing, &mut policy)?;
            desired.insert(policy.name_any());
            self.ctx.sync.sync(policy).await?;
        }

        let scope = OrphanScope {
            namespace: &id.namespace,
            owner_uid: Some(&id.uid),
            selector: None,
            parent: &id.name,
            discriminator: ROUTING,
        };
        self.ctx
            .sync
            .collect_orphans::<NetworkPolicy>(&scope, &desired)
            .await?;
        Ok(StepOutcome::Synced)
    }
}

/// The Routing pipeline, in execution order
pub fn orchestrator(
    store: Arc<dyn ParentStore<Routing>>,
    events: Arc<dyn EventPublisher>,
    ctx: Arc<StepContext>,
) -> Orchestrator<Routing> {
    let ingress: Arc<dyn IngressDeriver<Routing>> =
        Arc::new(RoutingIngress::new(ctx.config.clone(), ctx.resolver.clone()));

    Orchestrator::new(store, events)
        .with_step(CertificateStep::new(ctx.clone(), ingress.clone()))
        .with_step(GatewayStep::new(ctx.clone(), ingress.clone()))
        .with_step(VirtualServiceStep::new(ctx.clone(), ingress))
        .with_step(RoutingNetworkPolicyStep::new(ctx.clone()))
        .with_finalizer(CertificateFinalizer::new(ctx))
}

/// Shared context for the Routing controller
pub struct RoutingContext {
    /// The step pipeline
    pub orchestrator: Orchestrator<Routing>,
}

impl RoutingContext {
    /// Create a context around a pipeline
    pub fn new(orchestrator: Orchestrator<Routing>) -> Self {
        Self { orchestrator }
    }
}

/// Reconcile a Routing
#[instrument(skip(routing, ctx), fields(routing = %routing.name_any(), namespace = ?routing.namespace()))]
pub async fn reconcile(routing: Arc<Routing>, ctx: Arc<RoutingContext>) -> Result<Action> {
    info!("reconciling routing");
    ctx.orchestrator.reconcile(&routing).await
}

/// Requeue a failed Routing
pub fn error_policy(routing: Arc<Routing>, error: &Error, _ctx: Arc<RoutingContext>) -> Action {
    error!(
        ?error,
        routing = %routing.name_any(),
        retryable = error.is_retryable(),
        "routing reconciliation failed"
    );
    Action::requeue(retry_after(error))
}
