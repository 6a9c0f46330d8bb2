//! Identity translation for cluster-scoped resources.
//!
//! A cluster-scoped downstream object `name` lives upstream as `{owner_namespace}-{name}` inside
//! the provider's owner namespace. Since `-` is legal in namespace names, a name prefix alone
//! cannot tell owner `team` apart from owner `team-x`; upstream copies therefore carry owner
//! tags (owner namespace, its UID, the source name) and every read checks them.

use ferry_core::{
    meta, ObjectKey, SyncError, ANNOTATION_OWNER_NAMESPACE, ANNOTATION_OWNER_NAMESPACE_UID, ANNOTATION_SOURCE_NAME,
};
use kube::core::DynamicObject;

pub const SEPARATOR: &str = "-";

/// Upstream name of a cluster-scoped downstream object.
pub fn upstream_name(owner_namespace: &str, name: &str) -> String {
    format!("{}{}{}", owner_namespace, SEPARATOR, name)
}

/// Downstream name for an upstream name, or `None` if it lacks this owner's prefix.
pub fn downstream_name<'a>(owner_namespace: &str, upstream_name: &'a str) -> Option<&'a str> {
    upstream_name.strip_prefix(owner_namespace)?.strip_prefix(SEPARATOR).filter(|n| !n.is_empty())
}

/// Translation bound to one provider's owner namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterScope {
    owner_namespace: String,
    owner_namespace_uid: String,
}

impl ClusterScope {
    pub fn new(owner_namespace: impl Into<String>, owner_namespace_uid: impl Into<String>) -> Self {
        Self { owner_namespace: owner_namespace.into(), owner_namespace_uid: owner_namespace_uid.into() }
    }

    pub fn owner_namespace(&self) -> &str { &self.owner_namespace }

    /// Where the upstream copy of downstream `name` lives.
    pub fn upstream_key(&self, name: &str) -> ObjectKey {
        ObjectKey::namespaced(self.owner_namespace.clone(), upstream_name(&self.owner_namespace, name))
    }

    /// Rewrite a downstream object into its upstream form and tag it with the owner.
    pub fn to_upstream(&self, obj: &mut DynamicObject) -> Result<(), SyncError> {
        let name = obj.metadata.name.clone().filter(|n| !n.is_empty()).ok_or_else(|| SyncError::Malformed("object has no name".into()))?;
        obj.metadata.name = Some(upstream_name(&self.owner_namespace, &name));
        obj.metadata.namespace = Some(self.owner_namespace.clone());
        meta::set_annotation(obj, ANNOTATION_OWNER_NAMESPACE, &self.owner_namespace);
        if !self.owner_namespace_uid.is_empty() {
            meta::set_annotation(obj, ANNOTATION_OWNER_NAMESPACE_UID, &self.owner_namespace_uid);
        }
        meta::set_annotation(obj, ANNOTATION_SOURCE_NAME, &name);
        Ok(())
    }

    /// Downstream name of an upstream object if it belongs to this owner.
    ///
    /// Requires the name prefix; owner tags, when present, must agree with it.
    pub fn owned_name<'a>(&self, obj: &'a DynamicObject) -> Option<&'a str> {
        if obj.metadata.namespace.as_deref() != Some(self.owner_namespace.as_str()) { return None; }
        let name = downstream_name(&self.owner_namespace, obj.metadata.name.as_deref()?)?;
        if let Some(owner) = meta::annotation(obj, ANNOTATION_OWNER_NAMESPACE) {
            if owner != self.owner_namespace { return None; }
        }
        if let Some(uid) = meta::annotation(obj, ANNOTATION_OWNER_NAMESPACE_UID) {
            if !self.owner_namespace_uid.is_empty() && uid != self.owner_namespace_uid { return None; }
        }
        if let Some(source) = meta::annotation(obj, ANNOTATION_SOURCE_NAME) {
            if source != name { return None; }
        }
        Some(name)
    }

    pub fn downstream_key(&self, obj: &DynamicObject) -> Option<ObjectKey> { self.owned_name(obj).map(ObjectKey::cluster) }

    /// Rewrite an upstream object back to downstream identity, stripping the owner tags.
    pub fn from_upstream(&self, obj: &DynamicObject) -> Result<DynamicObject, SyncError> {
        let name = self.owned_name(obj).ok_or_else(|| {
            SyncError::ForeignOwner(format!("{}/{}", obj.metadata.namespace.as_deref().unwrap_or(""), obj.metadata.name.as_deref().unwrap_or("")))
        })?;
        let mut out = obj.clone();
        out.metadata.name = Some(name.to_string());
        out.metadata.namespace = None;
        meta::remove_annotation(&mut out, ANNOTATION_OWNER_NAMESPACE);
        meta::remove_annotation(&mut out, ANNOTATION_OWNER_NAMESPACE_UID);
        meta::remove_annotation(&mut out, ANNOTATION_SOURCE_NAME);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn cluster_obj(name: &str) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
            data: serde_json::json!({ "spec": { "size": 2 } }),
        }
    }

    #[test]
    fn names_roundtrip_over_identifier_alphabet() {
        let owners = ["p1-teamA", "a", "kube-bind-x7f2", "ns.with.dots", "0"];
        let names = ["widget-1", "w", "a-b-c", "x.y", "9-"];
        for owner in owners {
            for name in names {
                let up = upstream_name(owner, name);
                assert_eq!(downstream_name(owner, &up), Some(name), "owner={} name={}", owner, name);
            }
        }
    }

    #[test]
    fn foreign_prefix_is_not_stripped() {
        assert_eq!(downstream_name("team-a", "team-b-widget"), None);
        assert_eq!(downstream_name("team", "teamx-widget"), None);
        // the prefix alone leaves nothing to recover
        assert_eq!(downstream_name("team", "team-"), None);
    }

    #[test]
    fn widget_lands_under_owner_namespace_with_tags() {
        let scope = ClusterScope::new("p1-teamA", "6f1c");
        let mut o = cluster_obj("widget-1");
        scope.to_upstream(&mut o).expect("translate");
        assert_eq!(o.metadata.name.as_deref(), Some("p1-teamA-widget-1"));
        assert_eq!(o.metadata.namespace.as_deref(), Some("p1-teamA"));
        assert_eq!(meta::annotation(&o, ANNOTATION_OWNER_NAMESPACE), Some("p1-teamA"));
        assert_eq!(meta::annotation(&o, ANNOTATION_OWNER_NAMESPACE_UID), Some("6f1c"));
        assert_eq!(meta::annotation(&o, ANNOTATION_SOURCE_NAME), Some("widget-1"));

        let back = scope.from_upstream(&o).expect("owned");
        assert_eq!(back.metadata.name.as_deref(), Some("widget-1"));
        assert_eq!(back.metadata.namespace, None);
        assert!(back.metadata.annotations.is_none());
        assert_eq!(back.data, o.data);
    }

    #[test]
    fn nested_owner_prefix_is_rejected_by_tags() {
        // owner "team-x" writes "y" as "team-x-y"; owner "team" would strip it to "x-y"
        let other = ClusterScope::new("team-x", "uid-x");
        let mut o = cluster_obj("y");
        other.to_upstream(&mut o).expect("translate");
        o.metadata.namespace = Some("team".into());

        let mine = ClusterScope::new("team", "uid-team");
        assert_eq!(mine.owned_name(&o), None);
        assert!(matches!(mine.from_upstream(&o), Err(SyncError::ForeignOwner(_))));
    }

    #[test]
    fn stale_owner_uid_is_rejected() {
        let old = ClusterScope::new("team", "uid-old");
        let mut o = cluster_obj("w");
        old.to_upstream(&mut o).expect("translate");
        let current = ClusterScope::new("team", "uid-new");
        assert!(current.downstream_key(&o).is_none());
        assert_eq!(old.downstream_key(&o), Some(ObjectKey::cluster("w")));
    }

    #[test]
    fn untagged_objects_fall_back_to_prefix() {
        let scope = ClusterScope::new("team", "");
        let mut o = cluster_obj("team-w");
        o.metadata.namespace = Some("team".into());
        assert_eq!(scope.downstream_key(&o), Some(ObjectKey::cluster("w")));
    }
}
