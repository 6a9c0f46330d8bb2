//! Picks the provider that owns a downstream object.

use std::sync::Arc;

use ferry_core::{meta, Keyed, SyncError, ANNOTATION_PROVIDER_CLUSTER_ID};
use kube::core::DynamicObject;

use crate::provider::ProviderTarget;

/// Outcome of a successful resolution.
///
/// `assign` is set when the provider was picked implicitly; the caller persists it on the
/// downstream object with its next write.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub target: Arc<ProviderTarget>,
    pub assign: Option<String>,
}

impl Resolution {
    /// Set the provider annotation on `obj` if resolution asked for it. Returns true on change.
    pub fn apply_to(&self, obj: &mut DynamicObject) -> bool {
        match &self.assign {
            Some(id) if meta::annotation(obj, ANNOTATION_PROVIDER_CLUSTER_ID) != Some(id.as_str()) => {
                meta::set_annotation(obj, ANNOTATION_PROVIDER_CLUSTER_ID, id);
                true
            }
            _ => false,
        }
    }
}

/// Static provider registry.
#[derive(Debug, Clone)]
pub struct ProviderResolver {
    targets: Vec<Arc<ProviderTarget>>,
}

impl ProviderResolver {
    pub fn new(targets: Vec<Arc<ProviderTarget>>) -> Self { Self { targets } }

    pub fn by_cluster_id(&self, cluster_id: &str) -> Option<&Arc<ProviderTarget>> {
        self.targets.iter().find(|t| t.cluster_id == cluster_id)
    }

    pub fn resolve(&self, obj: &DynamicObject) -> Result<Resolution, SyncError> {
        let object = obj.object_key().map(|k| k.to_string()).unwrap_or_default();
        if let Some(cluster_id) = meta::annotation(obj, ANNOTATION_PROVIDER_CLUSTER_ID) {
            let target = self
                .by_cluster_id(cluster_id)
                .ok_or_else(|| SyncError::UnknownProvider { object, cluster_id: cluster_id.to_string() })?;
            return Ok(Resolution { target: Arc::clone(target), assign: None });
        }
        match self.targets.as_slice() {
            [only] => Ok(Resolution { target: Arc::clone(only), assign: Some(only.cluster_id.clone()) }),
            _ => Err(SyncError::AmbiguousOwnership { object, providers: self.targets.len() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Transport;
    use ferry_store::{IndexedCache, MemoryObjectStore, MemoryServiceNamespaceStore};
    use kube::core::ObjectMeta;

    fn target(id: &str) -> Arc<ProviderTarget> {
        let objects = Arc::new(IndexedCache::new(format!("{}-objects", id)));
        let sns = Arc::new(IndexedCache::new(format!("{}-sns", id)));
        let transport = Transport {
            objects: Arc::new(MemoryObjectStore::new(Arc::clone(&objects))),
            service_namespaces: Arc::new(MemoryServiceNamespaceStore::new(Arc::clone(&sns))),
        };
        Arc::new(ProviderTarget::new(id, format!("kube-bind-{}", id), "uid", objects, sns, transport))
    }

    fn obj(annotation: Option<&str>) -> DynamicObject {
        let mut o = DynamicObject {
            types: None,
            metadata: ObjectMeta { name: Some("w".into()), namespace: Some("team-a".into()), ..Default::default() },
            data: serde_json::json!({}),
        };
        if let Some(id) = annotation { meta::set_annotation(&mut o, ANNOTATION_PROVIDER_CLUSTER_ID, id); }
        o
    }

    #[test]
    fn single_provider_is_assigned_without_touching_input() {
        let r = ProviderResolver::new(vec![target("p1")]);
        let o = obj(None);
        let res = r.resolve(&o).expect("resolved");
        assert_eq!(res.target.cluster_id, "p1");
        assert_eq!(res.assign.as_deref(), Some("p1"));
        assert_eq!(meta::annotation(&o, ANNOTATION_PROVIDER_CLUSTER_ID), None);

        let mut written = o.clone();
        assert!(res.apply_to(&mut written));
        assert_eq!(meta::annotation(&written, ANNOTATION_PROVIDER_CLUSTER_ID), Some("p1"));
        assert!(!res.apply_to(&mut written));
    }

    #[test]
    fn several_providers_without_annotation_is_ambiguous() {
        let r = ProviderResolver::new(vec![target("p1"), target("p2")]);
        for _ in 0..3 {
            assert!(matches!(r.resolve(&obj(None)), Err(SyncError::AmbiguousOwnership { providers: 2, .. })));
        }
    }

    #[test]
    fn explicit_annotation_selects_target() {
        let r = ProviderResolver::new(vec![target("p1"), target("p2")]);
        let res = r.resolve(&obj(Some("p2"))).expect("resolved");
        assert_eq!(res.target.cluster_id, "p2");
        assert!(res.assign.is_none());
    }

    #[test]
    fn unknown_provider_is_reported() {
        let r = ProviderResolver::new(vec![target("p1")]);
        let err = r.resolve(&obj(Some("p9"))).unwrap_err();
        assert!(matches!(err, SyncError::UnknownProvider { ref cluster_id, .. } if cluster_id == "p9"));
    }

    #[test]
    fn no_providers_is_ambiguous_too() {
        let r = ProviderResolver::new(Vec::new());
        assert!(matches!(r.resolve(&obj(None)), Err(SyncError::AmbiguousOwnership { providers: 0, .. })));
    }
}
