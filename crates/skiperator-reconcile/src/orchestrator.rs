//! Reconcile Orchestrator
//!
//! Runs one pass over a parent:
//!
//! 1. fetch the latest parent (gone: nothing to do)
//! 2. deleting: run the finalizers and release the parent
//! 3. ensure our finalizer is present
//! 4. default the spec; if that changed anything, persist and requeue
//! 5. run the ordered steps, tracking one sub-status per step
//! 6. persist the aggregated status if it changed
//!
//! Steps never sleep. A step that is waiting on the cluster returns
//! [`StepOutcome::RequeueAfter`], which ends the pass.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use skiperator_common::events::{EventPublisher, ParentEvent};
use skiperator_common::kube_utils::{has_finalizer, is_deleting};
use skiperator_common::{Error, Result, SkiperatorStatus, Status, FINALIZER};
use tracing::{debug, info, warn};

use crate::parent::{Parent, ParentStore};

/// Requeue delay after writing to the parent itself
pub const PERSIST_REQUEUE: Duration = Duration::from_secs(1);

/// Periodic resync of a fully synced parent
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(300);

/// Requeue delay after a retryable error
pub const TRANSIENT_RETRY: Duration = Duration::from_secs(30);

/// Requeue delay after an error that needs a spec or cluster change
pub const PERMANENT_RETRY: Duration = Duration::from_secs(60);

/// How long the controller waits before retrying a failed pass
pub fn retry_after(error: &Error) -> Duration {
    if error.is_retryable() {
        TRANSIENT_RETRY
    } else {
        PERMANENT_RETRY
    }
}

/// Result of one step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Desired state written
    Synced,
    /// Waiting on the cluster; end the pass and come back later
    RequeueAfter(Duration),
}

/// One ordered unit of reconciliation, e.g. "Deployment" or "NetworkPolicy"
#[async_trait]
pub trait ReconcileStep<P>: Send + Sync {
    /// Name used as the sub-status key and in event reasons
    fn name(&self) -> &'static str;

    /// Derive and synchronize this step's objects.
    ///
    /// `status` is the in-flight status of the parent; most steps only read
    /// it, run-state tracking writes conditions to it.
    async fn reconcile(&self, parent: &P, status: &mut SkiperatorStatus) -> Result<StepOutcome>;
}

/// Cleanup run before the finalizer is removed from a deleted parent
#[async_trait]
pub trait StepFinalizer<P>: Send + Sync {
    /// Release everything owner references do not cover
    async fn finalize(&self, parent: &P) -> Result<()>;
}

/// Ordered step pipeline for one parent kind
pub struct Orchestrator<P: Parent> {
    store: Arc<dyn ParentStore<P>>,
    events: Arc<dyn EventPublisher>,
    steps: Vec<Box<dyn ReconcileStep<P>>>,
    finalizers: Vec<Box<dyn StepFinalizer<P>>>,
    resync: Duration,
}

impl<P: Parent> Orchestrator<P> {
    /// Create an empty pipeline
    pub fn new(store: Arc<dyn ParentStore<P>>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            events,
            steps: Vec::new(),
            finalizers: Vec::new(),
            resync: DEFAULT_RESYNC,
        }
    }

    /// Append a step
    pub fn with_step(mut self, step: impl ReconcileStep<P> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Append a finalizer
    pub fn with_finalizer(mut self, finalizer: impl StepFinalizer<P> + 'static) -> Self {
        self.finalizers.push(Box::new(finalizer));
        self
    }

    /// Override the periodic resync interval
    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    /// Step names in execution order
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run one reconcile pass
    pub async fn reconcile(&self, trigger: &P) -> Result<Action> {
        let name = trigger.name_any();
        let namespace = trigger.namespace().unwrap_or_default();

        let Some(parent) = self.store.get(&namespace, &name).await? else {
            debug!("parent no longer exists");
            return Ok(Action::await_change());
        };

        if is_deleting(&parent) {
            if has_finalizer(&parent, FINALIZER) {
                self.finalize(&parent).await?;
            }
            return Ok(Action::await_change());
        }

        let parent = if has_finalizer(&parent, FINALIZER) {
            parent
        } else {
            let mut finalizers = parent.finalizers().to_vec();
            finalizers.push(FINALIZER.to_string());
            self.store.set_finalizers(&parent, finalizers).await?
        };

        let mut defaulted = parent.clone();
        if defaulted.apply_defaults() {
            info!("persisting defaulted spec");
            self.store.replace(&defaulted).await?;
            return Ok(Action::requeue(PERSIST_REQUEUE));
        }

        self.run_steps(&parent).await
    }

    async fn run_steps(&self, parent: &P) -> Result<Action> {
        let original = parent.skiperator_status().cloned().unwrap_or_default();
        let mut status = original.clone();
        let names = self.step_names();
        status.subresources.retain(|k, _| names.contains(&k.as_str()));

        let obj_ref = parent.object_ref(&());
        self.events
            .publish(
                &obj_ref,
                ParentEvent::ReconcileStarted {
                    kind: P::kind(&()).to_string(),
                },
            )
            .await;

        for step in &self.steps {
            let step_name = step.name();
            status.set(step_name, Status::Progressing, format!("{step_name} is progressing"));

            match step.reconcile(parent, &mut status).await {
                Ok(StepOutcome::Synced) => {
                    status.set(step_name, Status::Synced, format!("{step_name} has finished synchronizing"));
                }
                Ok(StepOutcome::RequeueAfter(after)) => {
                    debug!(step = step_name, ?after, "step requested requeue");
                    self.persist(parent, &original, &status).await?;
                    return Ok(Action::requeue(after));
                }
                Err(error) if error.is_transient() => {
                    debug!(step = step_name, %error, "step hit a transient error, retrying");
                    self.persist(parent, &original, &status).await?;
                    return Err(error);
                }
                Err(error) => {
                    warn!(step = step_name, %error, "step failed");
                    status.set(step_name, Status::Error, error.to_string());
                    self.events
                        .publish(
                            &obj_ref,
                            ParentEvent::StepFailed {
                                step: step_name.to_string(),
                                message: error.to_string(),
                            },
                        )
                        .await;
                    self.persist(parent, &original, &status).await?;
                    return Err(error);
                }
            }
        }

        self.persist(parent, &original, &status).await?;
        self.events
            .publish(
                &obj_ref,
                ParentEvent::ReconcileFinished {
                    kind: P::kind(&()).to_string(),
                },
            )
            .await;
        Ok(Action::requeue(self.resync))
    }

    async fn persist(
        &self,
        parent: &P,
        original: &SkiperatorStatus,
        status: &SkiperatorStatus,
    ) -> Result<()> {
        if status.semantically_equal(original) {
            return Ok(());
        }
        self.store.patch_status(parent, status).await
    }

    async fn finalize(&self, parent: &P) -> Result<()> {
        for finalizer in &self.finalizers {
            finalizer.finalize(parent).await?;
        }
        let remaining: Vec<String> = parent
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        self.store.set_finalizers(parent, remaining).await?;
        self.events
            .publish(&parent.object_ref(&()), ParentEvent::Finalized)
            .await;
        info!("finalized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use skiperator_common::crd::{Routing, RoutingSpec};
    use k8s_openapi::api::core::v1::ObjectReference;
    use skiperator_common::NoopEventPublisher;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn routing(finalized: bool, defaulted: bool) -> Routing {
        let mut r = Routing::new(
            "web",
            RoutingSpec {
                hostname: "web.kartverket.no".to_string(),
                routes: vec![],
                redirect_to_https: defaulted.then_some(true),
            },
        );
        r.metadata.namespace = Some("team-a".to_string());
        r.metadata.uid = Some("uid-1".to_string());
        r.metadata.resource_version = Some("1".to_string());
        if finalized {
            r.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        }
        r
    }

    /// In-memory parent store recording every write
    #[derive(Default)]
    struct FakeStore {
        parent: Mutex<Option<Routing>>,
        replaced: Mutex<u32>,
        status_writes: Mutex<Vec<SkiperatorStatus>>,
        finalizer_writes: Mutex<Vec<Vec<String>>>,
    }

    impl FakeStore {
        fn holding(parent: Routing) -> Arc<Self> {
            Arc::new(Self {
                parent: Mutex::new(Some(parent)),
                ..Default::default()
            })
        }

        fn status_writes(&self) -> Vec<SkiperatorStatus> {
            self.status_writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ParentStore<Routing> for FakeStore {
        async fn get(&self, _namespace: &str, _name: &str) -> Result<Option<Routing>> {
            Ok(self.parent.lock().unwrap().clone())
        }

        async fn replace(&self, parent: &Routing) -> Result<()> {
            *self.replaced.lock().unwrap() += 1;
            *self.parent.lock().unwrap() = Some(parent.clone());
            Ok(())
        }

        async fn patch_status(&self, _parent: &Routing, status: &SkiperatorStatus) -> Result<()> {
            self.status_writes.lock().unwrap().push(status.clone());
            if let Some(p) = self.parent.lock().unwrap().as_mut() {
                p.status = Some(status.clone());
            }
            Ok(())
        }

        async fn set_finalizers(&self, parent: &Routing, finalizers: Vec<String>) -> Result<Routing> {
            self.finalizer_writes.lock().unwrap().push(finalizers.clone());
            let mut updated = parent.clone();
            updated.metadata.finalizers = Some(finalizers);
            *self.parent.lock().unwrap() = Some(updated.clone());
            Ok(updated)
        }
    }

    /// Publisher keeping every event it is handed
    #[derive(Default)]
    struct RecordedEvents(Mutex<Vec<ParentEvent>>);

    impl RecordedEvents {
        fn reasons(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(ParentEvent::reason).collect()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordedEvents {
        async fn publish(&self, _regarding: &ObjectReference, event: ParentEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    enum Behaviour {
        Sync,
        Requeue(u64),
        Fail,
        Conflict,
    }

    struct FakeStep {
        name: &'static str,
        behaviour: Behaviour,
        runs: Arc<Mutex<u32>>,
    }

    impl FakeStep {
        fn new(name: &'static str, behaviour: Behaviour) -> Self {
            Self {
                name,
                behaviour,
                runs: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl ReconcileStep<Routing> for FakeStep {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn reconcile(&self, _parent: &Routing, _status: &mut SkiperatorStatus) -> Result<StepOutcome> {
            *self.runs.lock().unwrap() += 1;
            match self.behaviour {
                Behaviour::Sync => Ok(StepOutcome::Synced),
                Behaviour::Requeue(s) => Ok(StepOutcome::RequeueAfter(Duration::from_secs(s))),
                Behaviour::Fail => Err(Error::derivation_for("web", "service backend not found")),
                Behaviour::Conflict => Err(Error::conflict("NetworkPolicy", "web-routing")),
            }
        }
    }

    struct RecordingFinalizer(Arc<Mutex<bool>>);

    #[async_trait]
    impl StepFinalizer<Routing> for RecordingFinalizer {
        async fn finalize(&self, _parent: &Routing) -> Result<()> {
            *self.0.lock().unwrap() = true;
            Ok(())
        }
    }

    fn orchestrator(store: Arc<FakeStore>) -> Orchestrator<Routing> {
        Orchestrator::new(store, Arc::new(NoopEventPublisher))
    }

    // =========================================================================
    // Reconciliation Story Tests
    // =========================================================================

    /// Story: a fully synced pass marks every step Synced and the summary Synced
    #[tokio::test]
    async fn story_all_steps_synced() {
        let parent = routing(true, true);
        let store = FakeStore::holding(parent.clone());
        let orch = orchestrator(store.clone())
            .with_step(FakeStep::new("Gateway", Behaviour::Sync))
            .with_step(FakeStep::new("VirtualService", Behaviour::Sync));

        let action = orch.reconcile(&parent).await.expect("reconcile should succeed");

        assert_eq!(action, Action::requeue(DEFAULT_RESYNC));
        let writes = store.status_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].summary.status, Status::Synced);
        assert_eq!(writes[0].subresources["Gateway"].status, Status::Synced);
    }

    /// Story: a second pass with nothing changed produces no status write
    #[tokio::test]
    async fn story_second_pass_is_write_free() {
        let parent = routing(true, true);
        let store = FakeStore::holding(parent.clone());
        let orch = orchestrator(store.clone()).with_step(FakeStep::new("Gateway", Behaviour::Sync));

        orch.reconcile(&parent).await.unwrap();
        orch.reconcile(&parent).await.unwrap();

        assert_eq!(store.status_writes().len(), 1);
        assert!(store.finalizer_writes.lock().unwrap().is_empty());
    }

    /// Story: a failing step stops the pass and is reported as Error
    #[tokio::test]
    async fn story_failing_step_stops_pipeline() {
        let parent = routing(true, true);
        let store = FakeStore::holding(parent.clone());
        let later = FakeStep::new("VirtualService", Behaviour::Sync);
        let later_runs = later.runs.clone();
        let orch = orchestrator(store.clone())
            .with_step(FakeStep::new("NetworkPolicy", Behaviour::Fail))
            .with_step(later);

        let err = orch.reconcile(&parent).await.unwrap_err();

        assert!(matches!(err, Error::Derivation { .. }));
        assert_eq!(*later_runs.lock().unwrap(), 0);
        let status = store.status_writes().pop().expect("status persisted");
        assert_eq!(status.summary.status, Status::Error);
        assert!(status.subresources["NetworkPolicy"].message.contains("backend not found"));
    }

    /// Story: a failed step is announced with a warning naming the step
    #[tokio::test]
    async fn story_failing_step_publishes_warning() {
        let parent = routing(true, true);
        let store = FakeStore::holding(parent.clone());
        let events = Arc::new(RecordedEvents::default());
        let orch = Orchestrator::new(store, events.clone())
            .with_step(FakeStep::new("NetworkPolicy", Behaviour::Fail));

        orch.reconcile(&parent).await.unwrap_err();

        assert_eq!(events.reasons(), vec!["ReconcileStart", "NetworkPolicyFailed"]);
    }

    /// Story: losing a write race is retried quietly instead of reported as an error
    #[tokio::test]
    async fn story_conflict_stays_progressing_without_warning() {
        let parent = routing(true, true);
        let store = FakeStore::holding(parent.clone());
        let events = Arc::new(RecordedEvents::default());
        let later = FakeStep::new("VirtualService", Behaviour::Sync);
        let later_runs = later.runs.clone();
        let orch = Orchestrator::new(store.clone(), events.clone())
            .with_step(FakeStep::new("Gateway", Behaviour::Sync))
            .with_step(FakeStep::new("NetworkPolicy", Behaviour::Conflict))
            .with_step(later);

        let err = orch.reconcile(&parent).await.unwrap_err();

        assert!(matches!(err, Error::Conflict { .. }));
        assert!(err.is_retryable());
        assert_eq!(*later_runs.lock().unwrap(), 0);
        let status = store.status_writes().pop().expect("status persisted");
        assert_eq!(status.subresources["Gateway"].status, Status::Synced);
        assert_eq!(status.subresources["NetworkPolicy"].status, Status::Progressing);
        assert_eq!(status.summary.status, Status::Progressing);
        assert_eq!(events.reasons(), vec!["ReconcileStart"]);
    }

    /// Story: a step waiting on the cluster ends the pass with its requeue delay
    #[tokio::test]
    async fn story_requeue_leaves_step_progressing() {
        let parent = routing(true, true);
        let store = FakeStore::holding(parent.clone());
        let orch = orchestrator(store.clone())
            .with_step(FakeStep::new("Job", Behaviour::Sync))
            .with_step(FakeStep::new("JobLifecycle", Behaviour::Requeue(5)));

        let action = orch.reconcile(&parent).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        let status = store.status_writes().pop().unwrap();
        assert_eq!(status.subresources["JobLifecycle"].status, Status::Progressing);
        assert_eq!(status.summary.status, Status::Progressing);
    }

    /// Story: defaulting persists the spec and requeues without running steps
    #[tokio::test]
    async fn story_defaulting_short_circuits() {
        let parent = routing(true, false);
        let store = FakeStore::holding(parent.clone());
        let step = FakeStep::new("Gateway", Behaviour::Sync);
        let runs = step.runs.clone();
        let orch = orchestrator(store.clone()).with_step(step);

        let action = orch.reconcile(&parent).await.unwrap();

        assert_eq!(action, Action::requeue(PERSIST_REQUEUE));
        assert_eq!(*store.replaced.lock().unwrap(), 1);
        assert_eq!(*runs.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_finalizer_is_added() {
        let parent = routing(false, true);
        let store = FakeStore::holding(parent.clone());
        let orch = orchestrator(store.clone()).with_step(FakeStep::new("Gateway", Behaviour::Sync));

        orch.reconcile(&parent).await.unwrap();

        let writes = store.finalizer_writes.lock().unwrap().clone();
        assert_eq!(writes, vec![vec![FINALIZER.to_string()]]);
    }

    /// Story: deleting a parent runs cleanup and releases the finalizer
    #[tokio::test]
    async fn story_deletion_runs_finalizers() {
        let mut parent = routing(true, true);
        parent.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let store = FakeStore::holding(parent.clone());
        let cleaned = Arc::new(Mutex::new(false));
        let step = FakeStep::new("Gateway", Behaviour::Sync);
        let runs = step.runs.clone();
        let orch = orchestrator(store.clone())
            .with_step(step)
            .with_finalizer(RecordingFinalizer(cleaned.clone()));

        let action = orch.reconcile(&parent).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(*cleaned.lock().unwrap());
        assert_eq!(*runs.lock().unwrap(), 0);
        assert_eq!(store.finalizer_writes.lock().unwrap().clone(), vec![Vec::<String>::new()]);
    }

    #[tokio::test]
    async fn vanished_parent_is_a_no_op() {
        let parent = routing(true, true);
        let store = Arc::new(FakeStore::default());
        let orch = orchestrator(store.clone()).with_step(FakeStep::new("Gateway", Behaviour::Sync));

        assert_eq!(orch.reconcile(&parent).await.unwrap(), Action::await_change());
        assert!(store.status_writes().is_empty());
    }

    #[tokio::test]
    async fn stale_step_entries_are_pruned() {
        let mut parent = routing(true, true);
        let mut status = SkiperatorStatus::default();
        status.set("Ingress", Status::Synced, "old step");
        parent.status = Some(status);
        let store = FakeStore::holding(parent.clone());
        let orch = orchestrator(store.clone()).with_step(FakeStep::new("Gateway", Behaviour::Sync));

        orch.reconcile(&parent).await.unwrap();

        let status = store.status_writes().pop().unwrap();
        assert!(!status.subresources.contains_key("Ingress"));
    }

    #[test]
    fn retry_delay_follows_retryability() {
        assert_eq!(retry_after(&Error::conflict("Service", "web")), TRANSIENT_RETRY);
        assert_eq!(retry_after(&Error::config("missing")), TRANSIENT_RETRY);
        assert_eq!(retry_after(&Error::derivation("bad port")), PERMANENT_RETRY);
    }
}
