//! Ownership and lifecycle tagging of derived objects
//!
//! Every derived object in the parent's namespace carries exactly one
//! controller owner reference (the parent) plus the managed-by label set.
//! Objects that must live in another namespace (Certificates in the gateway
//! namespace) cannot carry an owner reference and are tagged with labels
//! naming the parent instead.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use skiperator_common::kube_utils::label_selector;
use skiperator_common::{parent_labels, Error, Result, MANAGED_BY_LABEL, OPERATOR_NAME, PARENT_KIND_LABEL};

/// Relationship between an existing child and a would-be owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Claim {
    /// Controlled by the parent
    Owned,
    /// No controller; the parent may adopt it
    Unowned,
    /// Controlled by someone else
    Foreign(String),
}

/// Classify an existing object relative to the parent UID
pub fn claim<K: Resource>(child: &K, parent_uid: &str) -> Claim {
    match controller_of(child) {
        None => Claim::Unowned,
        Some(owner) if owner.uid == parent_uid => Claim::Owned,
        Some(owner) => Claim::Foreign(format!("{} {}", owner.kind, owner.name)),
    }
}

/// The controller owner reference of an object, if any
pub fn controller_of<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Whether any owner reference on the object points at the given UID
pub fn is_owned_by<K: Resource>(obj: &K, uid: &str) -> bool {
    obj.owner_references().iter().any(|r| r.uid == uid)
}

/// Labels placed on every object derived from a parent
pub fn managed_labels(parent_kind: &str, parent_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), OPERATOR_NAME.to_string()),
        (PARENT_KIND_LABEL.to_string(), parent_kind.to_lowercase()),
        (parent_labels::NAME.to_string(), parent_name.to_string()),
    ])
}

/// Labels identifying a parent on objects outside its namespace
pub fn cross_namespace_labels<P>(parent: &P) -> BTreeMap<String, String>
where
    P: Resource<DynamicType = ()>,
{
    let mut labels = managed_labels(&P::kind(&()), &parent.name_any());
    labels.insert(
        parent_labels::NAMESPACE.to_string(),
        parent.namespace().unwrap_or_default(),
    );
    labels.insert(parent_labels::KIND.to_string(), P::kind(&()).to_lowercase());
    labels
}

/// Label selector matching [`cross_namespace_labels`]
pub fn cross_namespace_selector<P>(parent: &P) -> String
where
    P: Resource<DynamicType = ()>,
{
    label_selector(&cross_namespace_labels(parent))
}

/// Tag a desired child with the parent's owner reference and managed labels.
///
/// The child is placed in the parent's namespace when it has none.
pub fn tag<P, C>(parent: &P, child: &mut C) -> Result<()>
where
    P: Resource<DynamicType = ()>,
    C: Resource,
{
    let owner = parent.controller_owner_ref(&()).ok_or_else(|| {
        Error::derivation_for(parent.name_any(), "parent has no uid, cannot own children")
    })?;

    let meta = child.meta_mut();
    if meta.namespace.is_none() {
        meta.namespace = parent.namespace();
    }
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .extend(managed_labels(&P::kind(&()), &parent.name_any()));
    meta.owner_references = Some(vec![owner]);
    Ok(())
}

/// Tag a desired child that lives outside the parent's namespace.
pub fn tag_cross_namespace<P, C>(parent: &P, child: &mut C)
where
    P: Resource<DynamicType = ()>,
    C: Resource,
{
    child
        .meta_mut()
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(cross_namespace_labels(parent));
}
