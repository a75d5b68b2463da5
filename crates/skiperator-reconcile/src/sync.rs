//! Object Synchronizer
//!
//! Writes one desired object into the cluster idempotently: read the current
//! object, decide whether it needs creating, updating or nothing, then write
//! with the read resourceVersion so a concurrent modification surfaces as a
//! retryable [`Error::Conflict`] instead of being overwritten.
//!
//! The decision is the pure [`plan`], so that idempotence can be tested
//! without a cluster.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use skiperator_common::kube_utils::{is_conflict, is_not_found};
use skiperator_common::naming::hash16;
use skiperator_common::{Error, Result, DESIRED_HASH_ANNOTATION, OPERATOR_NAME};
use tracing::{debug, info};

use crate::ownership::{claim, Claim};

/// Outcome of synchronizing one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncAction {
    /// The object did not exist and was created
    Created,
    /// The object differed and was replaced
    Updated,
    /// The object already matched
    Unchanged,
}

/// What needs to happen to bring the cluster to the desired object
#[derive(Clone, Debug, PartialEq)]
pub enum SyncPlan<K> {
    /// Create this object
    Create(K),
    /// Replace the current object with this one
    Update(K),
    /// Nothing to write
    Unchanged,
}

/// Decide how to reconcile `desired` against the current object.
///
/// The desired object is stamped with a fingerprint of itself before
/// comparing. An object is unchanged when every field set on the desired
/// object, fingerprint included, already holds the same value on the current
/// one. Fields defaulted by the API server are ignored, while a field dropped
/// from the desired object changes the fingerprint and so forces a replace
/// that prunes it. Updates keep the current resourceVersion, foreign labels and
/// annotations, and whatever `preserve` copies over (e.g. a Service's
/// allocated cluster IPs). An object controlled by another owner is an error;
/// an object without a controller is adopted.
pub fn plan<K, F>(current: Option<&K>, mut desired: K, preserve: F) -> Result<SyncPlan<K>>
where
    K: Resource<DynamicType = ()> + Serialize,
    F: FnOnce(&K, &mut K),
{
    stamp_fingerprint(&mut desired)?;

    let Some(current) = current else {
        return Ok(SyncPlan::Create(desired));
    };

    if let Some(owner) = desired.meta().owner_references.as_ref().and_then(|r| r.first()) {
        if let Claim::Foreign(by) = claim(current, &owner.uid) {
            return Err(Error::ownership(K::kind(&()), desired.name_any(), by));
        }
    }

    if owners_present(current, &desired)
        && is_subset(&comparable(&desired)?, &serde_json::to_value(current)?)
    {
        return Ok(SyncPlan::Unchanged);
    }

    let mut updated = desired;
    merge_metadata(current.meta(), updated.meta_mut());
    preserve(current, &mut updated);
    Ok(SyncPlan::Update(updated))
}

/// Record [`fingerprint`] of the object in its annotations
fn stamp_fingerprint<K: Resource + Serialize>(desired: &mut K) -> Result<()> {
    if let Some(annotations) = desired.meta_mut().annotations.as_mut() {
        annotations.remove(DESIRED_HASH_ANNOTATION);
    }
    let hash = fingerprint(desired)?;
    desired
        .annotations_mut()
        .insert(DESIRED_HASH_ANNOTATION.to_string(), hash);
    Ok(())
}

/// Stable hash of the managed part of an object.
///
/// `serde_json` maps are ordered, so equal objects serialize identically.
pub fn fingerprint<K: Resource + Serialize>(obj: &K) -> Result<String> {
    Ok(hash16(&comparable(obj)?.to_string()))
}

/// The desired object's JSON with metadata reduced to the fields we manage
fn comparable<K: Resource + Serialize>(desired: &K) -> Result<Value> {
    let mut value = serde_json::to_value(desired)?;
    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.retain(|k, _| matches!(k.as_str(), "labels" | "annotations"));
    }
    Ok(value)
}

/// Whether every owner reference of the desired object is already on the current one
fn owners_present<K: Resource>(current: &K, desired: &K) -> bool {
    let current_uids: Vec<&str> = current.owner_references().iter().map(|r| r.uid.as_str()).collect();
    desired
        .owner_references()
        .iter()
        .all(|r| current_uids.contains(&r.uid.as_str()))
}

/// Whether every value in `desired` is present and equal in `current`.
///
/// Objects compare key by key, arrays element by element with equal length.
pub fn is_subset(desired: &Value, current: &Value) -> bool {
    match (desired, current) {
        (Value::Object(d), Value::Object(c)) => d
            .iter()
            .all(|(k, v)| match c.get(k) {
                Some(cv) => is_subset(v, cv),
                None => is_empty(v),
            }),
        (Value::Array(d), Value::Array(c)) => {
            d.len() == c.len() && d.iter().zip(c).all(|(dv, cv)| is_subset(dv, cv))
        }
        (d, c) => d == c,
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(o) => o.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

fn merge_metadata(current: &ObjectMeta, desired: &mut ObjectMeta) {
    desired.resource_version = current.resource_version.clone();

    let merge = |current: &Option<BTreeMap<String, String>>, desired: &mut Option<BTreeMap<String, String>>| {
        if let Some(current) = current {
            let mut merged = current.clone();
            merged.extend(desired.take().unwrap_or_default());
            *desired = Some(merged);
        }
    };
    merge(&current.labels, &mut desired.labels);
    merge(&current.annotations, &mut desired.annotations);

    let desired_uids: Vec<String> = desired
        .owner_references
        .iter()
        .flatten()
        .map(|r| r.uid.clone())
        .collect();
    let foreign: Vec<_> = current
        .owner_references
        .iter()
        .flatten()
        .filter(|r| r.controller != Some(true) && !desired_uids.contains(&r.uid))
        .cloned()
        .collect();
    if !foreign.is_empty() {
        desired.owner_references.get_or_insert_with(Vec::new).extend(foreign);
    }

    if desired.finalizers.is_none() {
        desired.finalizers = current.finalizers.clone();
    }
}

/// Cluster-facing half of the synchronizer
#[derive(Clone)]
pub struct Synchronizer {
    client: Client,
}

impl Synchronizer {
    /// Create a synchronizer on the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Synchronize a desired object
    pub async fn sync<K>(&self, desired: K) -> Result<SyncAction>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
    {
        self.sync_with(desired, |_, _| {}).await
    }

    /// Synchronize a desired object, copying server-owned fields from the
    /// current object on update
    pub async fn sync_with<K, F>(&self, desired: K, preserve: F) -> Result<SyncAction>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
        F: FnOnce(&K, &mut K),
    {
        let kind = K::kind(&()).to_string();
        let name = desired.name_any();
        let namespace = desired.namespace().ok_or_else(|| {
            Error::derivation(format!("{kind} {name} has no namespace"))
        })?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);

        let current = api.get_opt(&name).await?;
        let params = PostParams {
            field_manager: Some(OPERATOR_NAME.to_string()),
            ..Default::default()
        };

        match plan(current.as_ref(), desired, preserve)? {
            SyncPlan::Create(obj) => {
                api.create(&params, &obj)
                    .await
                    .map_err(|e| write_error(&kind, &name, e))?;
                info!(kind = %kind, name = %name, namespace = %namespace, "created");
                Ok(SyncAction::Created)
            }
            SyncPlan::Update(obj) => {
                api.replace(&name, &params, &obj)
                    .await
                    .map_err(|e| write_error(&kind, &name, e))?;
                info!(kind = %kind, name = %name, namespace = %namespace, "updated");
                Ok(SyncAction::Updated)
            }
            SyncPlan::Unchanged => {
                debug!(kind = %kind, name = %name, "unchanged");
                Ok(SyncAction::Unchanged)
            }
        }
    }

    /// Fetch an object, `None` when it does not exist
    pub async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    /// List objects in a namespace, optionally filtered by a label selector
    pub async fn list<K>(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<K>>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    /// Delete an object. A missing object is not an error.
    ///
    /// Returns whether a delete was issued for an existing object.
    pub async fn delete<K>(&self, namespace: &str, name: &str) -> Result<bool>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(kind = %K::kind(&()), name = %name, namespace = %namespace, "deleted");
                Ok(true)
            }
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_error(kind: &str, name: &str, e: kube::Error) -> Error {
    if is_conflict(&e) {
        Error::conflict(kind, name)
    } else {
        e.into()
    }
}
