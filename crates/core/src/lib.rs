//! Ferry core types: object keys, resource descriptors, mapping records, errors and the
//! traits the reconciliation engine uses to reach its caches and transports.

#![forbid(unsafe_code)]

pub mod meta;

use std::fmt;
use std::sync::Arc;

use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

/// Annotation naming the provider cluster an object is bound to.
pub const ANNOTATION_PROVIDER_CLUSTER_ID: &str = "ferry.dev/provider-cluster-id";
/// Owner tags written onto upstream copies of cluster-scoped objects.
pub const ANNOTATION_OWNER_NAMESPACE: &str = "ferry.dev/owner-namespace";
pub const ANNOTATION_OWNER_NAMESPACE_UID: &str = "ferry.dev/owner-namespace-uid";
pub const ANNOTATION_SOURCE_NAME: &str = "ferry.dev/source-name";

/// Finalizer held on downstream objects until their upstream counterpart is gone.
pub const DOWNSTREAM_FINALIZER: &str = "ferry.dev/downstream";

/// Field manager used for server-side apply against providers.
pub const DEFAULT_FIELD_MANAGER: &str = "ferry.dev";

/// Cache index: objects by namespace.
pub const INDEX_NAMESPACE: &str = "namespace";
/// Cache index: service namespace records by the upstream namespace they provisioned.
pub const INDEX_SERVICE_NAMESPACE_BY_NAMESPACE: &str = "servicenamespace-by-namespace";

/// Canonical identity of a downstream object, used as the work queue key.
///
/// Renders as `namespace/name`, or just `name` for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self { Self { namespace: None, name: name.into() } }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Anything that can be stored in a keyed cache.
pub trait Keyed {
    /// `None` when the object lacks a name and cannot be addressed.
    fn object_key(&self) -> Option<ObjectKey>;
}

impl Keyed for DynamicObject {
    fn object_key(&self) -> Option<ObjectKey> {
        let name = self.metadata.name.as_deref().filter(|n| !n.is_empty())?;
        Some(ObjectKey::new(self.metadata.namespace.as_deref(), name))
    }
}

/// The bound resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
    /// Top-level `spec` fields the provider may amend; these flow upstream to downstream.
    pub provider_fields: Vec<String>,
}

impl ResourceDescriptor {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

/// Parse a `v1/Kind` or `group/v1/Kind` key.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind, SyncError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(SyncError::Malformed(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
    }
}

/// Provider-side record mapping one downstream namespace to a dedicated upstream namespace.
///
/// Lives in the provider's owner namespace and is named after the downstream namespace.
/// `upstream_namespace` stays empty until the provider has provisioned the namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNamespace {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub upstream_namespace: Option<String>,
}

impl ServiceNamespace {
    pub fn new(owner_namespace: impl Into<String>, downstream_namespace: impl Into<String>) -> Self {
        Self { namespace: owner_namespace.into(), name: downstream_namespace.into(), uid: None, upstream_namespace: None }
    }

    pub fn downstream_namespace(&self) -> &str { &self.name }

    pub fn ready_namespace(&self) -> Option<&str> { self.upstream_namespace.as_deref().filter(|ns| !ns.is_empty()) }
}

impl Keyed for ServiceNamespace {
    fn object_key(&self) -> Option<ObjectKey> {
        if self.name.is_empty() { return None; }
        Some(ObjectKey::namespaced(self.namespace.clone(), self.name.clone()))
    }
}

/// Result of waiting on a dependency that may not be observable yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness<T> {
    Ready(T),
    Pending,
}

/// How the controller treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff; expected to self-resolve.
    Transient,
    /// Retry with backoff; needs an operator to fix configuration or ownership.
    Unroutable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("object {object} references unconfigured provider cluster {cluster_id:?}")]
    UnknownProvider { object: String, cluster_id: String },
    #[error("object {object} has no provider annotation and {providers} providers are configured")]
    AmbiguousOwnership { object: String, providers: usize },
    #[error("upstream object {0} is owned by another consumer")]
    ForeignOwner(String),
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn is_not_found(&self) -> bool { matches!(self, SyncError::NotFound(_)) }

    pub fn is_already_exists(&self) -> bool { matches!(self, SyncError::AlreadyExists(_)) }

    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::UnknownProvider { .. }
            | SyncError::AmbiguousOwnership { .. }
            | SyncError::ForeignOwner(_)
            | SyncError::Malformed(_) => ErrorClass::Unroutable,
            _ => ErrorClass::Transient,
        }
    }
}

/// Point-in-time read access to a local cache.
pub trait Lister<T>: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Option<Arc<T>>;
    fn by_index(&self, index: &str, value: &str) -> Vec<Arc<T>>;
}

/// Remote reads and writes of bound objects on one cluster.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, SyncError>;
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, SyncError>;
    /// Server-side apply with force under `field_manager`.
    async fn apply(&self, obj: &DynamicObject, field_manager: &str) -> Result<DynamicObject, SyncError>;
    async fn delete(&self, key: &ObjectKey) -> Result<(), SyncError>;
}

/// Remote access to service namespace records on one provider.
#[async_trait::async_trait]
pub trait ServiceNamespaceStore: Send + Sync {
    async fn create(&self, sn: &ServiceNamespace) -> Result<ServiceNamespace, SyncError>;
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ServiceNamespace>, SyncError>;
}

pub mod prelude {
    pub use super::{
        Keyed, Lister, ObjectKey, ObjectStore, Readiness, ResourceDescriptor, ServiceNamespace, ServiceNamespaceStore,
        SyncError,
    };
}
