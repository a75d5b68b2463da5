//! Orphan Collector
//!
//! After a successful sync pass, per-entity objects (one per hostname or
//! external host) that are no longer desired are deleted. Only objects owned
//! by the parent (or labelled for it, outside its namespace) and named by the
//! deterministic naming scheme are candidates; anything else is left alone.

use std::collections::BTreeSet;
use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use skiperator_common::naming::matches_derived;
use skiperator_common::Result;
use tracing::info;

use crate::ownership::is_owned_by;
use crate::sync::Synchronizer;

/// Which objects of a kind a parent may garbage collect
#[derive(Clone, Debug)]
pub struct OrphanScope<'a> {
    /// Namespace to look in
    pub namespace: &'a str,
    /// Owner UID objects must reference; `None` when a label selector is used instead
    pub owner_uid: Option<&'a str>,
    /// Label selector objects must match
    pub selector: Option<&'a str>,
    /// Parent name, the prefix of derived names
    pub parent: &'a str,
    /// Naming discriminator, e.g. `ingress` or `egress`
    pub discriminator: &'a str,
}

/// Names of objects in `objects` that the scope owns and `desired` no longer contains
pub fn select_orphans<K: Resource>(
    objects: &[K],
    scope: &OrphanScope<'_>,
    desired: &BTreeSet<String>,
) -> Vec<String> {
    objects
        .iter()
        .filter(|o| scope.owner_uid.map_or(true, |uid| is_owned_by(*o, uid)))
        .map(|o| o.name_any())
        .filter(|name| matches_derived(scope.parent, scope.discriminator, name))
        .filter(|name| !desired.contains(name))
        .collect()
}

impl Synchronizer {
    /// Delete the objects of kind `K` in scope that are not desired.
    ///
    /// Returns the names of deleted objects. Objects that disappear between
    /// list and delete are ignored.
    pub async fn collect_orphans<K>(
        &self,
        scope: &OrphanScope<'_>,
        desired: &BTreeSet<String>,
    ) -> Result<Vec<String>>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let objects: Vec<K> = self.list(scope.namespace, scope.selector).await?;
        let orphans = select_orphans(&objects, scope, desired);

        let mut deleted = Vec::with_capacity(orphans.len());
        for name in orphans {
            if self.delete::<K>(scope.namespace, &name).await? {
                deleted.push(name);
            }
        }
        if !deleted.is_empty() {
            info!(
                kind = %K::kind(&()),
                parent = %scope.parent,
                count = deleted.len(),
                "collected orphaned objects"
            );
        }
        Ok(deleted)
    }

    /// Delete a one-per-parent object that is no longer desired, if the parent
    /// owns it. Returns whether anything was deleted.
    pub async fn delete_owned<K>(&self, namespace: &str, name: &str, owner_uid: &str) -> Result<bool>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        match self.get::<K>(namespace, name).await? {
            Some(obj) if is_owned_by(&obj, owner_uid) => self.delete::<K>(namespace, name).await,
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use skiperator_common::naming::{egress_name, EGRESS, INGRESS};
    use skiperator_common::resources::istio::ServiceEntry;

    fn entry(name: &str, owner_uid: &str) -> ServiceEntry {
        ServiceEntry {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("team-a".to_string()),
                owner_references: Some(vec![OwnerReference {
                    uid: owner_uid.to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: Default::default(),
        }
    }

    fn scope<'a>() -> OrphanScope<'a> {
        OrphanScope {
            namespace: "team-a",
            owner_uid: Some("uid-1"),
            selector: None,
            parent: "my-app",
            discriminator: EGRESS,
        }
    }

    /// Story: removing an external host from the access policy removes its ServiceEntry
    #[test]
    fn story_removed_host_is_collected() {
        let kept = egress_name("my-app", "example.com");
        let removed = egress_name("my-app", "old.example.com");
        let objects = vec![entry(&kept, "uid-1"), entry(&removed, "uid-1")];
        let desired = BTreeSet::from([kept]);

        assert_eq!(select_orphans(&objects, &scope(), &desired), vec![removed]);
    }

    #[test]
    fn objects_of_other_owners_are_never_collected() {
        let name = egress_name("my-app", "example.com");
        let objects = vec![entry(&name, "uid-2")];
        assert!(select_orphans(&objects, &scope(), &BTreeSet::new()).is_empty());
    }

    #[test]
    fn hand_named_objects_are_never_collected() {
        let objects = vec![
            entry("my-app-egress-custom", "uid-1"),
            entry(&egress_name("my-app", "x").replace("egress", INGRESS), "uid-1"),
        ];
        assert!(select_orphans(&objects, &scope(), &BTreeSet::new()).is_empty());
    }

    #[test]
    fn label_scoped_collection_ignores_owner() {
        let name = egress_name("my-app", "example.com");
        let objects = vec![entry(&name, "anything")];
        let scope = OrphanScope {
            owner_uid: None,
            selector: Some("application.skiperator.no/app-name=my-app"),
            ..scope()
        };
        assert_eq!(select_orphans(&objects, &scope, &BTreeSet::new()), vec![name]);
    }
}
