//! Parent resources and the cluster operations the orchestrator needs on them

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use skiperator_common::crd::{Application, Routing, SkipJob};
use skiperator_common::{Error, Result, SkiperatorStatus, OPERATOR_NAME};

/// A resource reconciled into derived objects
pub trait Parent:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Persisted status, if any
    fn skiperator_status(&self) -> Option<&SkiperatorStatus>;

    /// Fill in defaulted spec fields. Returns true when the spec changed.
    fn apply_defaults(&mut self) -> bool;
}

impl Parent for Application {
    fn skiperator_status(&self) -> Option<&SkiperatorStatus> {
        self.status.as_ref()
    }

    fn apply_defaults(&mut self) -> bool {
        self.spec.apply_defaults()
    }
}

impl Parent for SkipJob {
    fn skiperator_status(&self) -> Option<&SkiperatorStatus> {
        self.status.as_ref()
    }

    fn apply_defaults(&mut self) -> bool {
        self.spec.apply_defaults()
    }
}

impl Parent for Routing {
    fn skiperator_status(&self) -> Option<&SkiperatorStatus> {
        self.status.as_ref()
    }

    fn apply_defaults(&mut self) -> bool {
        self.spec.apply_defaults()
    }
}

/// Cluster operations on parents, abstracted for testing
#[async_trait]
pub trait ParentStore<P: Parent>: Send + Sync {
    /// Fetch the latest version of a parent
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<P>>;

    /// Persist a defaulted spec
    async fn replace(&self, parent: &P) -> Result<()>;

    /// Persist the status subresource
    async fn patch_status(&self, parent: &P, status: &SkiperatorStatus) -> Result<()>;

    /// Set the finalizer list, guarded by the parent's resourceVersion.
    /// Returns the updated parent.
    async fn set_finalizers(&self, parent: &P, finalizers: Vec<String>) -> Result<P>;
}

/// [`ParentStore`] backed by the Kubernetes API
pub struct KubeParentStore {
    client: Client,
}

impl KubeParentStore {
    /// Create a store on the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<P: Parent>(&self, parent: &P) -> Api<P> {
        Api::namespaced(self.client.clone(), &parent.namespace().unwrap_or_default())
    }
}

#[async_trait]
impl<P: Parent> ParentStore<P> for KubeParentStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<P>> {
        let api: Api<P> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace(&self, parent: &P) -> Result<()> {
        let name = parent.name_any();
        self.api(parent)
            .replace(&name, &PostParams::default(), parent)
            .await
            .map_err(|e| match e {
                kube::Error::Api(ae) if ae.code == 409 => Error::conflict(P::kind(&()), &name),
                e => e.into(),
            })?;
        Ok(())
    }

    async fn patch_status(&self, parent: &P, status: &SkiperatorStatus) -> Result<()> {
        let status_patch = serde_json::json!({ "status": status });
        self.api(parent)
            .patch_status(
                &parent.name_any(),
                &PatchParams::apply(OPERATOR_NAME),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }

    async fn set_finalizers(&self, parent: &P, finalizers: Vec<String>) -> Result<P> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": parent.resource_version(),
            }
        });
        let name = parent.name_any();
        self.api(parent)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| match e {
                kube::Error::Api(ae) if ae.code == 409 => Error::conflict(P::kind(&()), &name),
                e => e.into(),
            })
    }
}
