use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ferry_core::{ObjectStore, ServiceNamespace, ServiceNamespaceStore};
use ferry_store::IndexedCache;
use kube::core::DynamicObject;
use tracing::info;

use crate::scope::ClusterScope;

/// Remote handles of a provider; swapped as a unit on reconnect.
pub struct Transport {
    pub objects: Arc<dyn ObjectStore>,
    pub service_namespaces: Arc<dyn ServiceNamespaceStore>,
}

/// An upstream cluster binding.
pub struct ProviderTarget {
    pub cluster_id: String,
    /// Upstream namespace dedicated to this consumer.
    pub owner_namespace: String,
    pub owner_namespace_uid: String,
    /// Upstream objects of the bound type.
    pub objects: Arc<IndexedCache<DynamicObject>>,
    /// Service namespace records; must carry the by-namespace index.
    pub service_namespaces: Arc<IndexedCache<ServiceNamespace>>,
    transport: ArcSwap<Transport>,
}

impl ProviderTarget {
    pub fn new(
        cluster_id: impl Into<String>,
        owner_namespace: impl Into<String>,
        owner_namespace_uid: impl Into<String>,
        objects: Arc<IndexedCache<DynamicObject>>,
        service_namespaces: Arc<IndexedCache<ServiceNamespace>>,
        transport: Transport,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            owner_namespace: owner_namespace.into(),
            owner_namespace_uid: owner_namespace_uid.into(),
            objects,
            service_namespaces,
            transport: ArcSwap::from_pointee(transport),
        }
    }

    pub fn transport(&self) -> Arc<Transport> { self.transport.load_full() }

    /// Replace the remote handles, e.g. after credentials rotated.
    pub fn refresh_transport(&self, transport: Transport) {
        self.transport.store(Arc::new(transport));
        info!(provider = %self.cluster_id, "provider transport refreshed");
    }

    pub fn scope(&self) -> ClusterScope { ClusterScope::new(self.owner_namespace.clone(), self.owner_namespace_uid.clone()) }
}

impl fmt::Debug for ProviderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderTarget")
            .field("cluster_id", &self.cluster_id)
            .field("owner_namespace", &self.owner_namespace)
            .field("owner_namespace_uid", &self.owner_namespace_uid)
            .finish_non_exhaustive()
    }
}
