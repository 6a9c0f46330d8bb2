//! Ferry store: snapshot caches with secondary indexes, the controller work queue and
//! in-memory transports.

#![forbid(unsafe_code)]

pub mod memory;
pub mod queue;

pub use memory::{MemoryObjectStore, MemoryServiceNamespaceStore};
pub use queue::{ItemBackoff, WorkQueue};

use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwap;
use ferry_core::{Keyed, Lister, ObjectKey};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

pub type IndexValues = SmallVec<[String; 2]>;
pub type IndexFn<T> = Arc<dyn Fn(&T) -> IndexValues + Send + Sync>;

/// Change notifications delivered synchronously after each cache swap.
pub trait EventHandler<T>: Send + Sync {
    fn on_add(&self, obj: &T);
    fn on_update(&self, old: &T, new: &T);
    fn on_delete(&self, obj: &T);
}

struct Snapshot<T> {
    epoch: u64,
    items: FxHashMap<ObjectKey, Arc<T>>,
    indexes: FxHashMap<String, FxHashMap<String, Vec<ObjectKey>>>,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self { Self { epoch: self.epoch, items: self.items.clone(), indexes: self.indexes.clone() } }
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self { Self { epoch: 0, items: FxHashMap::default(), indexes: FxHashMap::default() } }
}

impl<T> Snapshot<T> {
    fn index(&mut self, indexers: &[(String, IndexFn<T>)], key: &ObjectKey, obj: &T) {
        for (name, f) in indexers {
            let idx = self.indexes.entry(name.clone()).or_default();
            for v in f(obj) {
                let keys = idx.entry(v).or_default();
                if !keys.contains(key) { keys.push(key.clone()); }
            }
        }
    }

    fn unindex(&mut self, indexers: &[(String, IndexFn<T>)], key: &ObjectKey, obj: &T) {
        for (name, f) in indexers {
            let Some(idx) = self.indexes.get_mut(name) else { continue };
            for v in f(obj) {
                if let Some(keys) = idx.get_mut(&v) {
                    keys.retain(|k| k != key);
                    if keys.is_empty() { idx.remove(&v); }
                }
            }
        }
    }
}

/// Local read cache fed by a single writer (typically a watcher).
///
/// Readers always see a consistent point-in-time snapshot; writes clone, mutate and swap.
pub struct IndexedCache<T> {
    name: String,
    snap: ArcSwap<Snapshot<T>>,
    indexers: Vec<(String, IndexFn<T>)>,
    writer: Mutex<()>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<T>>>>,
}

impl<T: Keyed + Send + Sync + 'static> IndexedCache<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snap: ArcSwap::from_pointee(Snapshot::default()),
            indexers: Vec::new(),
            writer: Mutex::new(()),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register a secondary index. Must happen before the first write.
    pub fn with_index<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&T) -> IndexValues + Send + Sync + 'static,
    {
        self.indexers.push((name.to_string(), Arc::new(f)));
        self
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn len(&self) -> usize { self.snap.load().items.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn epoch(&self) -> u64 { self.snap.load().epoch }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler<T>>) {
        self.handlers.write().unwrap_or_else(|e| e.into_inner()).push(handler);
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler<T>>> {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Insert or replace an object. Returns the previous version, if any.
    pub fn apply(&self, obj: T) -> Option<Arc<T>> {
        let Some(key) = obj.object_key() else {
            debug!(cache = %self.name, "ignoring object without a name");
            return None;
        };
        let new = Arc::new(obj);
        let old = {
            let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            let mut next = (**self.snap.load()).clone();
            let old = next.items.insert(key.clone(), Arc::clone(&new));
            if let Some(o) = &old { next.unindex(&self.indexers, &key, o); }
            next.index(&self.indexers, &key, &new);
            next.epoch = next.epoch.saturating_add(1);
            self.snap.store(Arc::new(next));
            old
        };
        for h in self.handlers() {
            match &old {
                Some(o) => h.on_update(o, &new),
                None => h.on_add(&new),
            }
        }
        old
    }

    /// Remove an object by key. Returns the removed version, if it was cached.
    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<T>> {
        let removed = {
            let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            let mut next = (**self.snap.load()).clone();
            let removed = next.items.remove(key)?;
            next.unindex(&self.indexers, key, &removed);
            next.epoch = next.epoch.saturating_add(1);
            self.snap.store(Arc::new(next));
            removed
        };
        for h in self.handlers() { h.on_delete(&removed); }
        Some(removed)
    }

    /// Replace the whole content (watch restart), notifying adds, updates and deletes.
    pub fn replace(&self, objs: Vec<T>) {
        let (added, updated, deleted) = {
            let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            let prev = self.snap.load_full();
            let mut next = Snapshot { epoch: prev.epoch.saturating_add(1), ..Snapshot::default() };
            let mut added = Vec::new();
            let mut updated = Vec::new();
            for obj in objs {
                let Some(key) = obj.object_key() else { continue };
                let obj = Arc::new(obj);
                next.index(&self.indexers, &key, &obj);
                match prev.items.get(&key) {
                    Some(old) => updated.push((Arc::clone(old), Arc::clone(&obj))),
                    None => added.push(Arc::clone(&obj)),
                }
                next.items.insert(key, obj);
            }
            let deleted: Vec<Arc<T>> =
                prev.items.iter().filter(|(k, _)| !next.items.contains_key(*k)).map(|(_, v)| Arc::clone(v)).collect();
            self.snap.store(Arc::new(next));
            (added, updated, deleted)
        };
        debug!(cache = %self.name, added = added.len(), updated = updated.len(), deleted = deleted.len(), "cache replaced");
        for h in self.handlers() {
            for o in &added { h.on_add(o); }
            for (old, new) in &updated { h.on_update(old, new); }
            for o in &deleted { h.on_delete(o); }
        }
    }
}

impl<T: Keyed + Send + Sync + 'static> Lister<T> for IndexedCache<T> {
    fn get(&self, key: &ObjectKey) -> Option<Arc<T>> { self.snap.load().items.get(key).cloned() }

    fn by_index(&self, index: &str, value: &str) -> Vec<Arc<T>> {
        let snap = self.snap.load();
        let Some(keys) = snap.indexes.get(index).and_then(|idx| idx.get(value)) else { return Vec::new() };
        keys.iter().filter_map(|k| snap.items.get(k).cloned()).collect()
    }
}

/// Index function for [`ferry_core::INDEX_NAMESPACE`].
pub fn namespace_index<T: Keyed>(obj: &T) -> IndexValues {
    obj.object_key().and_then(|k| k.namespace).into_iter().collect()
}

/// Index function for [`ferry_core::INDEX_SERVICE_NAMESPACE_BY_NAMESPACE`].
pub fn service_namespace_index(sn: &ferry_core::ServiceNamespace) -> IndexValues {
    sn.ready_namespace().map(str::to_string).into_iter().collect()
}

/// Object cache with the namespace index the router's fan-out relies on.
pub fn object_cache(name: &str) -> IndexedCache<kube::core::DynamicObject> {
    IndexedCache::new(name).with_index(ferry_core::INDEX_NAMESPACE, namespace_index)
}

/// Service namespace cache with the reverse index from upstream namespace to record.
pub fn service_namespace_cache(name: &str) -> IndexedCache<ferry_core::ServiceNamespace> {
    IndexedCache::new(name)
        .with_index(ferry_core::INDEX_NAMESPACE, namespace_index)
        .with_index(ferry_core::INDEX_SERVICE_NAMESPACE_BY_NAMESPACE, service_namespace_index)
}
