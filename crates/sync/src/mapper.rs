//! Downstream namespace → dedicated upstream namespace, via service namespace records.

use ferry_core::{Lister, ObjectKey, Readiness, ServiceNamespace, SyncError};
use metrics::counter;
use tracing::{debug, info};

use crate::provider::ProviderTarget;

/// Upstream namespace for `downstream_namespace` on `target`, creating the mapping record on
/// first use. `Pending` until the provider has provisioned the namespace.
pub async fn ensure_mapping(target: &ProviderTarget, downstream_namespace: &str) -> Result<Readiness<String>, SyncError> {
    let key = ObjectKey::namespaced(target.owner_namespace.clone(), downstream_namespace);
    let sn = match target.service_namespaces.get(&key) {
        Some(sn) => (*sn).clone(),
        None => {
            let transport = target.transport();
            let want = ServiceNamespace::new(target.owner_namespace.clone(), downstream_namespace);
            match transport.service_namespaces.create(&want).await {
                Ok(created) => {
                    counter!("ferry_service_namespaces_created_total", 1u64);
                    info!(provider = %target.cluster_id, namespace = %downstream_namespace, "created service namespace");
                    created
                }
                Err(e) if e.is_already_exists() => {
                    debug!(provider = %target.cluster_id, namespace = %downstream_namespace, "service namespace already exists");
                    match transport.service_namespaces.get(&target.owner_namespace, downstream_namespace).await? {
                        Some(sn) => sn,
                        None => return Ok(Readiness::Pending),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    };
    Ok(match sn.ready_namespace() {
        Some(ns) => Readiness::Ready(ns.to_string()),
        None => {
            debug!(provider = %target.cluster_id, namespace = %downstream_namespace, "service namespace not provisioned yet");
            Readiness::Pending
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Transport;
    use ferry_store::{IndexedCache, MemoryObjectStore, MemoryServiceNamespaceStore};
    use std::sync::Arc;

    fn target(provisioning: bool) -> (Arc<ProviderTarget>, Arc<MemoryServiceNamespaceStore>) {
        let objects = Arc::new(IndexedCache::new("objects"));
        let sns = Arc::new(ferry_store::service_namespace_cache("sns"));
        let store = Arc::new(if provisioning {
            MemoryServiceNamespaceStore::provisioning(Arc::clone(&sns))
        } else {
            MemoryServiceNamespaceStore::new(Arc::clone(&sns))
        });
        let transport = Transport { objects: Arc::new(MemoryObjectStore::new(Arc::clone(&objects))), service_namespaces: store.clone() };
        (Arc::new(ProviderTarget::new("p1", "kube-bind-p1", "uid", objects, sns, transport)), store)
    }

    #[tokio::test]
    async fn creates_once_and_returns_provisioned_namespace() {
        let (t, store) = target(true);
        assert_eq!(ensure_mapping(&t, "team-a").await.expect("ok"), Readiness::Ready("kube-bind-p1-team-a".into()));
        assert_eq!(ensure_mapping(&t, "team-a").await.expect("ok"), Readiness::Ready("kube-bind-p1-team-a".into()));
        assert_eq!(store.creates(), 1);
    }

    #[tokio::test]
    async fn unprovisioned_mapping_is_pending_until_ready() {
        let (t, store) = target(false);
        assert_eq!(ensure_mapping(&t, "team-a").await.expect("ok"), Readiness::Pending);
        assert_eq!(ensure_mapping(&t, "team-a").await.expect("ok"), Readiness::Pending);
        assert_eq!(store.creates(), 1);
        store.provision("kube-bind-p1", "team-a", "up-team-a").expect("provision");
        assert_eq!(ensure_mapping(&t, "team-a").await.expect("ok"), Readiness::Ready("up-team-a".into()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_converges() {
        let (t, store) = target(true);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = Arc::clone(&t);
            handles.push(tokio::spawn(async move { ensure_mapping(&t, "team-a").await }));
        }
        for h in handles {
            let got = h.await.expect("join").expect("no error");
            assert_eq!(got, Readiness::Ready("kube-bind-p1-team-a".into()));
        }
        assert_eq!(store.creates(), 1);
    }
}
