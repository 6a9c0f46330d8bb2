//! Turns change notifications from both sides into downstream-coordinate queue keys.
//!
//! Every source is wired through one [`SourceAdapter`]; only the [`KeyStrategy`] differs
//! between the consumer cache, provider object caches and provider service namespace caches.

use std::marker::PhantomData;
use std::sync::Arc;

use ferry_core::{Keyed, Lister, ObjectKey, ServiceNamespace, INDEX_NAMESPACE, INDEX_SERVICE_NAMESPACE_BY_NAMESPACE};
use ferry_store::{EventHandler, IndexedCache, WorkQueue};
use kube::core::DynamicObject;
use metrics::counter;
use smallvec::SmallVec;
use tracing::debug;

use crate::provider::ProviderTarget;
use crate::scope::ClusterScope;

pub type Keys = SmallVec<[ObjectKey; 1]>;

/// Derives the downstream keys affected by a change to `T`. Empty means "not ours".
pub trait KeyStrategy<T>: Send + Sync {
    fn keys(&self, obj: &T) -> Keys;
}

/// Subscribes to a cache and enqueues whatever keys its strategy derives.
pub struct SourceAdapter<T, S> {
    source: String,
    queue: Arc<WorkQueue<ObjectKey>>,
    strategy: S,
    _obj: PhantomData<fn(&T)>,
}

impl<T, S: KeyStrategy<T>> SourceAdapter<T, S> {
    pub fn new(source: impl Into<String>, queue: Arc<WorkQueue<ObjectKey>>, strategy: S) -> Self {
        Self { source: source.into(), queue, strategy, _obj: PhantomData }
    }

    fn route(&self, obj: &T) {
        let keys = self.strategy.keys(obj);
        if keys.is_empty() {
            counter!("ferry_events_dropped_total", 1u64);
            debug!(source = %self.source, "event maps to no downstream object; dropped");
            return;
        }
        for key in keys {
            debug!(source = %self.source, key = %key, "queueing");
            self.queue.add(key);
        }
    }
}

impl<T, S: KeyStrategy<T>> EventHandler<T> for SourceAdapter<T, S> {
    fn on_add(&self, obj: &T) { self.route(obj) }
    fn on_update(&self, _old: &T, new: &T) { self.route(new) }
    fn on_delete(&self, obj: &T) { self.route(obj) }
}

/// Consumer objects key themselves.
pub struct DownstreamKeys;

impl KeyStrategy<DynamicObject> for DownstreamKeys {
    fn keys(&self, obj: &DynamicObject) -> Keys { obj.object_key().into_iter().collect() }
}

/// Upstream copies of namespaced objects: the upstream namespace is reverse-mapped through
/// this provider's service namespace records.
pub struct NamespacedUpstreamKeys {
    pub target: Arc<ProviderTarget>,
}

impl KeyStrategy<DynamicObject> for NamespacedUpstreamKeys {
    fn keys(&self, obj: &DynamicObject) -> Keys {
        let (Some(ns), Some(name)) = (obj.metadata.namespace.as_deref(), obj.metadata.name.as_deref()) else {
            return Keys::new();
        };
        self.target
            .service_namespaces
            .by_index(INDEX_SERVICE_NAMESPACE_BY_NAMESPACE, ns)
            .iter()
            .find(|sn| sn.namespace == self.target.owner_namespace)
            .map(|sn| ObjectKey::namespaced(sn.downstream_namespace(), name))
            .into_iter()
            .collect()
    }
}

/// Upstream copies of cluster-scoped objects: recovered by stripping and verifying the owner
/// prefix and tags.
pub struct ClusterUpstreamKeys {
    pub scope: ClusterScope,
}

impl KeyStrategy<DynamicObject> for ClusterUpstreamKeys {
    fn keys(&self, obj: &DynamicObject) -> Keys { self.scope.downstream_key(obj).into_iter().collect() }
}

/// A service namespace change unblocks every consumer object in the mapped namespace.
pub struct MappingFanOut {
    pub owner_namespace: String,
    pub downstream: Arc<dyn Lister<DynamicObject>>,
}

impl KeyStrategy<ServiceNamespace> for MappingFanOut {
    fn keys(&self, sn: &ServiceNamespace) -> Keys {
        if sn.namespace != self.owner_namespace { return Keys::new(); }
        self.downstream
            .by_index(INDEX_NAMESPACE, sn.downstream_namespace())
            .iter()
            .filter_map(|o| o.object_key())
            .collect()
    }
}

/// Subscribe the queue to the consumer cache and to every provider's caches.
pub fn register(
    queue: &Arc<WorkQueue<ObjectKey>>,
    downstream: &Arc<IndexedCache<DynamicObject>>,
    targets: &[Arc<ProviderTarget>],
    namespaced: bool,
) {
    downstream.subscribe(Arc::new(SourceAdapter::<DynamicObject, _>::new("consumer", Arc::clone(queue), DownstreamKeys)));
    for target in targets {
        let source = format!("provider/{}", target.cluster_id);
        if namespaced {
            let strategy = NamespacedUpstreamKeys { target: Arc::clone(target) };
            target.objects.subscribe(Arc::new(SourceAdapter::<DynamicObject, _>::new(source.clone(), Arc::clone(queue), strategy)));
        } else {
            let strategy = ClusterUpstreamKeys { scope: target.scope() };
            target.objects.subscribe(Arc::new(SourceAdapter::<DynamicObject, _>::new(source.clone(), Arc::clone(queue), strategy)));
        }
        let lister: Arc<dyn Lister<DynamicObject>> = downstream.clone();
        let fan_out = MappingFanOut { owner_namespace: target.owner_namespace.clone(), downstream: lister };
        target
            .service_namespaces
            .subscribe(Arc::new(SourceAdapter::<ServiceNamespace, _>::new(format!("{}/servicenamespaces", source), Arc::clone(queue), fan_out)));
        debug!(provider = %target.cluster_id, namespaced, "event sources registered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Transport;
    use ferry_store::{ItemBackoff, MemoryObjectStore, MemoryServiceNamespaceStore};
    use kube::core::ObjectMeta;
    use std::time::Duration;

    fn queue() -> Arc<WorkQueue<ObjectKey>> {
        WorkQueue::new("test", ItemBackoff::new(Duration::from_millis(5), Duration::from_secs(1)))
    }

    fn target(id: &str, owner: &str) -> Arc<ProviderTarget> {
        let objects = Arc::new(ferry_store::object_cache("objects"));
        let sns = Arc::new(ferry_store::service_namespace_cache("sns"));
        let transport = Transport {
            objects: Arc::new(MemoryObjectStore::new(Arc::clone(&objects))),
            service_namespaces: Arc::new(MemoryServiceNamespaceStore::new(Arc::clone(&sns))),
        };
        Arc::new(ProviderTarget::new(id, owner, "uid-1", objects, sns, transport))
    }

    fn obj(ns: Option<&str>, name: &str) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta { name: Some(name.into()), namespace: ns.map(str::to_string), ..Default::default() },
            data: serde_json::json!({}),
        }
    }

    fn mapped(owner: &str, downstream: &str, upstream: &str) -> ServiceNamespace {
        ServiceNamespace { upstream_namespace: Some(upstream.into()), ..ServiceNamespace::new(owner, downstream) }
    }

    #[test]
    fn upstream_namespaced_event_maps_back_through_service_namespace() {
        let t = target("p1", "kube-bind-p1");
        t.service_namespaces.apply(mapped("kube-bind-p1", "team-a", "kube-bind-p1-team-a"));
        let s = NamespacedUpstreamKeys { target: Arc::clone(&t) };
        assert_eq!(s.keys(&obj(Some("kube-bind-p1-team-a"), "db")).to_vec(), vec![ObjectKey::namespaced("team-a", "db")]);
        assert!(s.keys(&obj(Some("unmapped"), "db")).is_empty());
    }

    #[test]
    fn mapping_owned_by_another_provider_namespace_is_ignored() {
        let t = target("p1", "kube-bind-p1");
        t.service_namespaces.apply(mapped("kube-bind-other", "team-a", "shared-ns"));
        let s = NamespacedUpstreamKeys { target: t };
        assert!(s.keys(&obj(Some("shared-ns"), "db")).is_empty());
    }

    #[test]
    fn upstream_cluster_event_requires_owner_prefix() {
        let t = target("p1", "p1-teamA");
        let s = ClusterUpstreamKeys { scope: t.scope() };
        let mut up = obj(None, "widget-1");
        t.scope().to_upstream(&mut up).expect("translate");
        assert_eq!(s.keys(&up).to_vec(), vec![ObjectKey::cluster("widget-1")]);
        assert!(s.keys(&obj(Some("p1-teamA"), "p2-teamB-widget-1")).is_empty());
    }

    #[test]
    fn mapping_event_fans_out_to_namespace_members() {
        let q = queue();
        let downstream = Arc::new(ferry_store::object_cache("consumer"));
        downstream.apply(obj(Some("team-a"), "one"));
        downstream.apply(obj(Some("team-a"), "two"));
        downstream.apply(obj(Some("team-b"), "three"));
        let t = target("p1", "kube-bind-p1");
        register(&q, &downstream, &[Arc::clone(&t)], true);
        assert!(q.is_empty(), "subscription happens after the seed objects");

        t.service_namespaces.apply(mapped("kube-bind-p1", "team-a", "up-a"));
        assert_eq!(q.len(), 2);
        // a record from another consumer's namespace fans out to nothing
        t.service_namespaces.apply(mapped("kube-bind-other", "team-b", "up-b"));
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn both_sides_collapse_onto_one_key() {
        let q = queue();
        let downstream = Arc::new(ferry_store::object_cache("consumer"));
        let t = target("p1", "kube-bind-p1");
        t.service_namespaces.apply(mapped("kube-bind-p1", "team-a", "up-a"));
        register(&q, &downstream, &[Arc::clone(&t)], true);

        downstream.apply(obj(Some("team-a"), "db"));
        t.objects.apply(obj(Some("up-a"), "db"));
        t.objects.delete(&ObjectKey::namespaced("up-a", "db"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(ObjectKey::namespaced("team-a", "db")));
    }
}
