//! Builds one controller future per parent kind

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use skiperator_common::crd::{Application, Routing, SkipJob};
use skiperator_common::{KubeEventPublisher, OperatorConfig};
use skiperator_network::KubeServiceResolver;
use skiperator_reconcile::{KubeParentStore, Synchronizer};
use skiperator_workload::StepContext;

/// Watch timeout in seconds, below the client's read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn step_context(client: &Client, config: &Arc<OperatorConfig>, controller: &str) -> Arc<StepContext> {
    Arc::new(StepContext {
        sync: Synchronizer::new(client.clone()),
        config: config.clone(),
        resolver: Arc::new(KubeServiceResolver::new(client.clone())),
        events: Arc::new(KubeEventPublisher::new(client.clone(), controller)),
    })
}

/// Application controller, re-triggered by changes to the objects it owns
pub fn build_application_controller(client: Client, config: Arc<OperatorConfig>) -> ControllerFuture {
    let ctx = step_context(&client, &config, "application-controller");
    let orchestrator = skiperator_application::orchestrator(
        Arc::new(KubeParentStore::new(client.clone())),
        ctx.events.clone(),
        ctx,
    );
    let ctx = Arc::new(skiperator_application::ApplicationContext::new(orchestrator));

    tracing::info!("- Application controller");
    Box::pin(
        Controller::new(Api::<Application>::all(client.clone()), watcher())
            .owns(Api::<Deployment>::all(client.clone()), watcher())
            .owns(Api::<Service>::all(client.clone()), watcher())
            .owns(Api::<ServiceAccount>::all(client.clone()), watcher())
            .owns(Api::<NetworkPolicy>::all(client.clone()), watcher())
            .owns(Api::<HorizontalPodAutoscaler>::all(client.clone()), watcher())
            .owns(Api::<PodDisruptionBudget>::all(client), watcher())
            .shutdown_on_signal()
            .run(
                skiperator_application::reconcile,
                skiperator_application::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("Application")),
    )
}

/// SKIPJob controller.
///
/// Jobs spawned by a CronJob are owned by the CronJob, so runs are mapped back
/// to their SKIPJob through the run label instead of owner references.
pub fn build_skipjob_controller(client: Client, config: Arc<OperatorConfig>) -> ControllerFuture {
    let ctx = step_context(&client, &config, "skipjob-controller");
    let orchestrator = skiperator_job::orchestrator(
        Arc::new(KubeParentStore::new(client.clone())),
        ctx.events.clone(),
        ctx,
    );
    let ctx = Arc::new(skiperator_job::SkipJobContext::new(orchestrator));

    tracing::info!("- SKIPJob controller");
    Box::pin(
        Controller::new(Api::<SkipJob>::all(client.clone()), watcher())
            .owns(Api::<CronJob>::all(client.clone()), watcher())
            .owns(Api::<ServiceAccount>::all(client.clone()), watcher())
            .owns(Api::<NetworkPolicy>::all(client.clone()), watcher())
            .watches(
                Api::<Job>::all(client),
                watcher().labels(skiperator_job::SKIPJOB_NAME_LABEL),
                |job| run_owner(&job),
            )
            .shutdown_on_signal()
            .run(skiperator_job::reconcile, skiperator_job::error_policy, ctx)
            .for_each(log_reconcile_result("SKIPJob")),
    )
}

/// The SKIPJob a batch Job belongs to, by its run label
fn run_owner(job: &Job) -> Option<ObjectRef<SkipJob>> {
    let name = job.labels().get(skiperator_job::SKIPJOB_NAME_LABEL)?;
    let namespace = job.namespace()?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// Routing controller
pub fn build_routing_controller(client: Client, config: Arc<OperatorConfig>) -> ControllerFuture {
    let ctx = step_context(&client, &config, "routing-controller");
    let orchestrator = skiperator_routing::orchestrator(
        Arc::new(KubeParentStore::new(client.clone())),
        ctx.events.clone(),
        ctx,
    );
    let ctx = Arc::new(skiperator_routing::RoutingContext::new(orchestrator));

    tracing::info!("- Routing controller");
    Box::pin(
        Controller::new(Api::<Routing>::all(client.clone()), watcher())
            .owns(Api::<NetworkPolicy>::all(client), watcher())
            .shutdown_on_signal()
            .run(skiperator_routing::reconcile, skiperator_routing::error_policy, ctx)
            .for_each(log_reconcile_result("Routing")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
