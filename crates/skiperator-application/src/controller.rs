//! Application controller
//!
//! Wires the Application step list into an [`Orchestrator`] and exposes the
//! `reconcile` / `error_policy` pair driven by `kube::runtime::Controller`.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use skiperator_common::crd::Application;
use skiperator_common::{Error, EventPublisher, OperatorConfig, Result};
use skiperator_network::{parse_hostnames, IngressCompiler, IngressObjects};
use skiperator_reconcile::{retry_after, Orchestrator, ParentStore};
use skiperator_workload::steps::with_parent;
use skiperator_workload::{
    CertificateFinalizer, CertificateStep, GatewayStep, GcpAuthConfigMapStep, IngressDeriver,
    NetworkPolicyStep, OwnedObjectStep, ParentIdentity, ServiceAccountStep, ServiceEntryStep,
    StepContext, VirtualServiceStep,
};
use tracing::{error, info, instrument};

use crate::identity::IdentityProviderClientsStep;
use crate::security::{
    desired_authorization_policy, desired_peer_authentication, desired_request_authentication,
    desired_service_monitor,
};
use crate::workload::{
    desired_autoscaler, desired_deployment, desired_disruption_budget, desired_service,
    keep_autoscaled_replicas, keep_cluster_ips,
};

/// Ingress objects of an Application, one set per hostname
pub struct ApplicationIngress {
    config: Arc<OperatorConfig>,
}

impl ApplicationIngress {
    /// Create a deriver for the given operator configuration
    pub fn new(config: Arc<OperatorConfig>) -> Self {
        Self { config }
    }

    /// Derive without touching the cluster
    pub fn objects(&self, app: &Application) -> Result<IngressObjects> {
        let id = ParentIdentity::of(app)?;
        let hostnames = parse_hostnames(&app.spec.ingresses, &self.config)
            .map_err(|e| with_parent(e, &id.name))?;
        Ok(IngressCompiler::new(&self.config).compile_application(
            &id.name,
            &id.namespace,
            &hostnames,
            app.spec.port,
            app.spec.redirects_to_https(),
        ))
    }
}

#[async_trait]
impl IngressDeriver<Application> for ApplicationIngress {
    async fn derive(&self, app: &Application) -> Result<IngressObjects> {
        self.objects(app)
    }
}

/// The Application pipeline, in execution order
pub fn orchestrator(
    store: Arc<dyn ParentStore<Application>>,
    events: Arc<dyn EventPublisher>,
    ctx: Arc<StepContext>,
) -> Orchestrator<Application> {
    let ingress: Arc<dyn IngressDeriver<Application>> =
        Arc::new(ApplicationIngress::new(ctx.config.clone()));

    Orchestrator::new(store, events)
        .with_step(ServiceAccountStep::new(ctx.clone()))
        .with_step(GcpAuthConfigMapStep::new(ctx.clone()))
        .with_step(IdentityProviderClientsStep::new(ctx.clone()))
        .with_step(
            OwnedObjectStep::new("Deployment", ctx.clone(), |app, ctx| {
                desired_deployment(app, &ctx.config)
            })
            .preserving(keep_autoscaled_replicas),
        )
        .with_step(
            OwnedObjectStep::new("Service", ctx.clone(), |app, _| desired_service(app))
                .preserving(keep_cluster_ips),
        )
        .with_step(NetworkPolicyStep::new(ctx.clone()))
        .with_step(ServiceEntryStep::new(ctx.clone()))
        .with_step(CertificateStep::new(ctx.clone(), ingress.clone()))
        .with_step(GatewayStep::new(ctx.clone(), ingress.clone()))
        .with_step(VirtualServiceStep::new(ctx.clone(), ingress))
        .with_step(OwnedObjectStep::new(
            "HorizontalPodAutoscaler",
            ctx.clone(),
            |app, _| desired_autoscaler(app),
        ))
        .with_step(OwnedObjectStep::new(
            "PodDisruptionBudget",
            ctx.clone(),
            |app, ctx| desired_disruption_budget(app, &ctx.config),
        ))
        .with_step(OwnedObjectStep::new(
            "PeerAuthentication",
            ctx.clone(),
            |app, _| desired_peer_authentication(app),
        ))
        .with_step(OwnedObjectStep::new(
            "AuthorizationPolicy",
            ctx.clone(),
            |app, ctx| desired_authorization_policy(app, &ctx.config),
        ))
        .with_step(OwnedObjectStep::new(
            "RequestAuthentication",
            ctx.clone(),
            |app, _| desired_request_authentication(app),
        ))
        .with_step(OwnedObjectStep::new(
            "ServiceMonitor",
            ctx.clone(),
            |app, _| desired_service_monitor(app),
        ))
        .with_finalizer(CertificateFinalizer::new(ctx))
}

/// Shared context for the Application controller
pub struct ApplicationContext {
    /// The step pipeline
    pub orchestrator: Orchestrator<Application>,
}

impl ApplicationContext {
    /// Create a context around a pipeline
    pub fn new(orchestrator: Orchestrator<Application>) -> Self {
        Self { orchestrator }
    }
}

/// Reconcile an Application
#[instrument(skip(app, ctx), fields(app = %app.name_any(), namespace = ?app.namespace()))]
pub async fn reconcile(app: Arc<Application>, ctx: Arc<ApplicationContext>) -> Result<Action> {
    info!("reconciling application");
    ctx.orchestrator.reconcile(&app).await
}

/// Requeue a failed Application
pub fn error_policy(app: Arc<Application>, error: &Error, _ctx: Arc<ApplicationContext>) -> Action {
    error!(
        ?error,
        app = %app.name_any(),
        retryable = error.is_retryable(),
        "application reconciliation failed"
    );
    Action::requeue(retry_after(error))
}
