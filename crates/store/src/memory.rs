//! In-memory transports backed by an [`IndexedCache`]: writes land directly in the cache, so
//! subscribers observe them like watch events. Used for local runs and for driving the
//! controller in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ferry_core::{meta, Keyed, Lister, ObjectKey, ObjectStore, ServiceNamespace, ServiceNamespaceStore, SyncError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use tracing::debug;
use uuid::Uuid;

use crate::IndexedCache;

/// A cluster's object API simulated over a cache.
///
/// Mirrors the server behaviours the engine relies on: create conflicts, update of missing
/// objects, finalizer-gated deletion, uid and resourceVersion bookkeeping.
pub struct MemoryObjectStore {
    cache: Arc<IndexedCache<DynamicObject>>,
    rv: AtomicU64,
    writes: AtomicUsize,
    history: Mutex<Vec<(&'static str, ObjectKey)>>,
    failures: Mutex<VecDeque<SyncError>>,
    server: Mutex<()>,
}

impl MemoryObjectStore {
    pub fn new(cache: Arc<IndexedCache<DynamicObject>>) -> Self {
        Self {
            cache,
            rv: AtomicU64::new(1),
            writes: AtomicUsize::new(0),
            history: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            server: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<IndexedCache<DynamicObject>> { &self.cache }

    /// Number of successful writes so far.
    pub fn writes(&self) -> usize { self.writes.load(Ordering::SeqCst) }

    /// `(operation, key)` for every successful write, oldest first.
    pub fn history(&self) -> Vec<(&'static str, ObjectKey)> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Make the next write fail with `err`.
    pub fn fail_next(&self, err: SyncError) { self.failures.lock().unwrap_or_else(|e| e.into_inner()).push_back(err); }

    fn injected(&self) -> Result<(), SyncError> {
        match self.failures.lock().unwrap_or_else(|e| e.into_inner()).pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn key_of(obj: &DynamicObject) -> Result<ObjectKey, SyncError> {
        obj.object_key().ok_or_else(|| SyncError::Malformed("object has no name".into()))
    }

    fn next_rv(&self) -> String { self.rv.fetch_add(1, Ordering::SeqCst).to_string() }

    fn record(&self, op: &'static str, key: ObjectKey) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(op, key = %key, "memory store write");
        self.history.lock().unwrap_or_else(|e| e.into_inner()).push((op, key));
    }

    fn serialize(&self) -> std::sync::MutexGuard<'_, ()> { self.server.lock().unwrap_or_else(|e| e.into_inner()) }

    fn store(&self, obj: DynamicObject) -> DynamicObject {
        self.cache.apply(obj.clone());
        obj
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, SyncError> {
        let _server = self.serialize();
        self.injected()?;
        let key = Self::key_of(obj)?;
        if self.cache.get(&key).is_some() { return Err(SyncError::AlreadyExists(key.to_string())); }
        let mut new = obj.clone();
        new.metadata.uid = Some(Uuid::new_v4().to_string());
        new.metadata.resource_version = Some(self.next_rv());
        new.metadata.deletion_timestamp = None;
        self.record("create", key);
        Ok(self.store(new))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, SyncError> {
        let _server = self.serialize();
        self.injected()?;
        let key = Self::key_of(obj)?;
        let Some(live) = self.cache.get(&key) else { return Err(SyncError::NotFound(key.to_string())) };
        if let (Some(want), Some(have)) = (obj.metadata.resource_version.as_deref(), live.metadata.resource_version.as_deref()) {
            if want != have {
                return Err(SyncError::Conflict(format!("{} has resourceVersion {}, not {}", key, have, want)));
            }
        }
        let mut new = obj.clone();
        new.metadata.uid = live.metadata.uid.clone();
        new.metadata.deletion_timestamp = live.metadata.deletion_timestamp.clone();
        new.metadata.resource_version = Some(self.next_rv());
        self.record("update", key.clone());
        if meta::is_deleting(&new) && new.metadata.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true) {
            self.cache.delete(&key);
            return Ok(new);
        }
        Ok(self.store(new))
    }

    async fn apply(&self, obj: &DynamicObject, field_manager: &str) -> Result<DynamicObject, SyncError> {
        let _server = self.serialize();
        self.injected()?;
        let key = Self::key_of(obj)?;
        let mut new = match self.cache.get(&key) {
            Some(live) => {
                let mut merged = (*live).clone();
                for (k, v) in obj.metadata.annotations.iter().flatten() { meta::set_annotation(&mut merged, k, v); }
                merge_json(&mut merged.data, &obj.data);
                merged
            }
            None => {
                let mut created = obj.clone();
                created.metadata.uid = Some(Uuid::new_v4().to_string());
                created
            }
        };
        new.metadata.resource_version = Some(self.next_rv());
        debug!(field_manager, key = %key, "memory apply");
        self.record("apply", key);
        Ok(self.store(new))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), SyncError> {
        let _server = self.serialize();
        self.injected()?;
        let Some(live) = self.cache.get(key) else { return Err(SyncError::NotFound(key.to_string())) };
        if live.metadata.finalizers.as_ref().map(|f| !f.is_empty()).unwrap_or(false) {
            if meta::is_deleting(&live) { return Ok(()); }
            let mut marked = (*live).clone();
            marked.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            marked.metadata.resource_version = Some(self.next_rv());
            self.record("delete", key.clone());
            self.cache.apply(marked);
            return Ok(());
        }
        self.record("delete", key.clone());
        self.cache.delete(key);
        Ok(())
    }
}

/// Approximates server-side apply: maps merge key by key, anything else is replaced.
/// Fields absent from the patch keep their live value.
fn merge_json(dst: &mut serde_json::Value, src: &serde_json::Value) {
    match (dst, src) {
        (serde_json::Value::Object(d), serde_json::Value::Object(s)) => {
            for (k, v) in s {
                match d.get_mut(k) {
                    Some(existing) => merge_json(existing, v),
                    None => {
                        d.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, s) => *d = s.clone(),
    }
}

type Provisioner = Arc<dyn Fn(&ServiceNamespace) -> String + Send + Sync>;

/// Service namespace records simulated over a cache, optionally provisioned on create the way
/// a provider backend eventually fills in `status.namespace`.
pub struct MemoryServiceNamespaceStore {
    cache: Arc<IndexedCache<ServiceNamespace>>,
    provisioner: Option<Provisioner>,
    creates: AtomicUsize,
    server: Mutex<()>,
}

impl MemoryServiceNamespaceStore {
    pub fn new(cache: Arc<IndexedCache<ServiceNamespace>>) -> Self {
        Self { cache, provisioner: None, creates: AtomicUsize::new(0), server: Mutex::new(()) }
    }

    /// Provision every created record immediately as `{owner_namespace}-{downstream_namespace}`.
    pub fn provisioning(cache: Arc<IndexedCache<ServiceNamespace>>) -> Self {
        let f: Provisioner = Arc::new(|sn: &ServiceNamespace| format!("{}-{}", sn.namespace, sn.name));
        Self { cache, provisioner: Some(f), creates: AtomicUsize::new(0), server: Mutex::new(()) }
    }

    pub fn creates(&self) -> usize { self.creates.load(Ordering::SeqCst) }

    /// Mark an existing record as provisioned.
    pub fn provision(&self, namespace: &str, name: &str, upstream_namespace: &str) -> Result<(), SyncError> {
        let key = ObjectKey::namespaced(namespace, name);
        let Some(live) = self.cache.get(&key) else { return Err(SyncError::NotFound(key.to_string())) };
        let mut sn = (*live).clone();
        sn.upstream_namespace = Some(upstream_namespace.to_string());
        self.cache.apply(sn);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ServiceNamespaceStore for MemoryServiceNamespaceStore {
    async fn create(&self, sn: &ServiceNamespace) -> Result<ServiceNamespace, SyncError> {
        let key = sn.object_key().ok_or_else(|| SyncError::Malformed("service namespace has no name".into()))?;
        let _server = self.server.lock().unwrap_or_else(|e| e.into_inner());
        if self.cache.get(&key).is_some() { return Err(SyncError::AlreadyExists(key.to_string())); }
        let mut new = sn.clone();
        new.uid = Some(Uuid::new_v4().to_string());
        if let Some(p) = &self.provisioner { new.upstream_namespace = Some(p(&new)); }
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.cache.apply(new.clone());
        Ok(new)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ServiceNamespace>, SyncError> {
        Ok(self.cache.get(&ObjectKey::namespaced(namespace, name)).map(|sn| (*sn).clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn obj(ns: Option<&str>, name: &str, finalizer: bool) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: ns.map(str::to_string),
                finalizers: finalizer.then(|| vec!["x/y".to_string()]),
                ..Default::default()
            },
            data: serde_json::json!({ "spec": { "size": 1 } }),
        }
    }

    #[tokio::test]
    async fn create_then_create_conflicts() {
        let store = MemoryObjectStore::new(Arc::new(IndexedCache::new("objs")));
        let created = store.create(&obj(Some("ns"), "a", false)).await.expect("create");
        assert!(created.metadata.uid.is_some());
        let err = store.create(&obj(Some("ns"), "a", false)).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn finalizers_gate_deletion_until_removed() {
        let store = MemoryObjectStore::new(Arc::new(IndexedCache::new("objs")));
        store.create(&obj(None, "w", true)).await.expect("create");
        let key = ObjectKey::cluster("w");
        store.delete(&key).await.expect("delete");
        let live = store.cache().get(&key).expect("still present");
        assert!(meta::is_deleting(&live));

        let mut cleared = (*live).clone();
        meta::remove_finalizer(&mut cleared, "x/y");
        store.update(&cleared).await.expect("update");
        assert!(store.cache().get(&key).is_none());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let store = MemoryObjectStore::new(Arc::new(IndexedCache::new("objs")));
        store.fail_next(SyncError::Transport("boom".into()));
        assert!(store.create(&obj(None, "w", false)).await.is_err());
        assert!(store.create(&obj(None, "w", false)).await.is_ok());
    }

    #[tokio::test]
    async fn apply_keeps_fields_the_patch_omits() {
        let store = MemoryObjectStore::new(Arc::new(IndexedCache::new("objs")));
        let mut live = obj(None, "w", false);
        live.data = serde_json::json!({ "spec": { "size": 1, "endpoint": "10.0.0.1" } });
        store.create(&live).await.expect("create");

        let mut patch = obj(None, "w", false);
        patch.data = serde_json::json!({ "spec": { "size": 3 } });
        let applied = store.apply(&patch, "test").await.expect("apply");
        assert_eq!(applied.data, serde_json::json!({ "spec": { "size": 3, "endpoint": "10.0.0.1" } }));
    }

    #[tokio::test]
    async fn service_namespace_create_is_exclusive() {
        let cache = Arc::new(IndexedCache::new("sns"));
        let store = MemoryServiceNamespaceStore::provisioning(cache);
        let sn = store.create(&ServiceNamespace::new("owner", "team-a")).await.expect("create");
        assert_eq!(sn.ready_namespace(), Some("owner-team-a"));
        assert!(store.create(&ServiceNamespace::new("owner", "team-a")).await.unwrap_err().is_already_exists());
        assert_eq!(store.creates(), 1);
    }
}
