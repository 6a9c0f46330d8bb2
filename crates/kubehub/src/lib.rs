//! Ferry kubehub: kube clients per context, discovery, watchers feeding local caches and
//! `DynamicObject` transports.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use ferry_core::{Keyed, ObjectKey, ObjectStore, ResourceDescriptor, ServiceNamespace, ServiceNamespaceStore, SyncError};
use ferry_store::IndexedCache;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    config::KubeConfigOptions,
    core::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta, TypeMeta},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config,
};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SERVICE_NAMESPACE_GROUP: &str = "ferry.dev";
pub const SERVICE_NAMESPACE_VERSION: &str = "v1alpha1";
pub const SERVICE_NAMESPACE_KIND: &str = "ServiceNamespace";
pub const SERVICE_NAMESPACE_PLURAL: &str = "servicenamespaces";

/// Client for a kubeconfig context, or the inferred default when `context` is `None`.
pub async fn client_for_context(context: Option<&str>) -> Result<Client> {
    let config = match context {
        Some(ctx) => {
            let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
            Config::from_kubeconfig(&opts).await.with_context(|| format!("loading kubeconfig context {}", ctx))?
        }
        None => Config::infer().await.context("inferring kube config")?,
    };
    Client::try_from(config).context("building kube client")
}

pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Resolve a `group/version/Kind` key against the consumer's discovery.
pub async fn discover_descriptor(client: Client, gvk_key: &str, provider_fields: Vec<String>) -> Result<ResourceDescriptor> {
    let gvk = ferry_core::parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client, &gvk).await?;
    Ok(ResourceDescriptor { group: ar.group, version: ar.version, kind: ar.kind, plural: ar.plural, namespaced, provider_fields })
}

/// UID of a namespace, used to tag upstream copies of cluster-scoped objects.
pub async fn namespace_uid(client: Client, name: &str) -> Result<String> {
    let api: Api<Namespace> = Api::all(client);
    let ns = api.get(name).await.with_context(|| format!("reading namespace {}", name))?;
    ns.metadata.uid.ok_or_else(|| anyhow!("namespace {} has no uid", name))
}

pub fn service_namespace_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(SERVICE_NAMESPACE_GROUP, SERVICE_NAMESPACE_VERSION, SERVICE_NAMESPACE_KIND);
    ApiResource::from_gvk_with_plural(&gvk, SERVICE_NAMESPACE_PLURAL)
}

pub fn service_namespace_from_dynamic(obj: &DynamicObject) -> Option<ServiceNamespace> {
    let upstream_namespace = obj
        .data
        .get("status")
        .and_then(|s| s.get("namespace"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some(ServiceNamespace {
        namespace: obj.metadata.namespace.clone()?,
        name: obj.metadata.name.clone()?,
        uid: obj.metadata.uid.clone(),
        upstream_namespace,
    })
}

pub fn service_namespace_to_dynamic(sn: &ServiceNamespace) -> DynamicObject {
    let ar = service_namespace_resource();
    DynamicObject {
        types: Some(TypeMeta { api_version: ar.api_version, kind: ar.kind }),
        metadata: ObjectMeta { namespace: Some(sn.namespace.clone()), name: Some(sn.name.clone()), ..Default::default() },
        data: serde_json::json!({ "spec": {} }),
    }
}

/// Translate a kube error into the engine's error taxonomy.
pub fn map_kube_error(e: kube::Error) -> SyncError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => SyncError::NotFound(ae.message),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => SyncError::AlreadyExists(ae.message),
        kube::Error::Api(ae) if ae.code == 409 => SyncError::Conflict(ae.message),
        other => SyncError::Transport(other.to_string()),
    }
}

fn apply_event<T, F>(cache: &IndexedCache<T>, ev: Event<DynamicObject>, convert: &F)
where
    T: Keyed + Send + Sync + 'static,
    F: Fn(DynamicObject) -> Option<T>,
{
    match ev {
        Event::Applied(o) => {
            if let Some(t) = convert(o) { cache.apply(t); }
        }
        Event::Deleted(o) => {
            if let Some(key) = convert(o).and_then(|t| t.object_key()) { cache.delete(&key); }
        }
        Event::Restarted(list) => {
            debug!(cache = %cache.name(), count = list.len(), "watch restart");
            cache.replace(list.into_iter().filter_map(convert).collect());
        }
    }
}

/// List+watch `api` into `cache` until cancelled. Watch errors are retried with backoff.
pub fn spawn_watcher<T, F>(api: Api<DynamicObject>, cache: Arc<IndexedCache<T>>, convert: F, cancel: CancellationToken) -> JoinHandle<()>
where
    T: Keyed + Send + Sync + 'static,
    F: Fn(DynamicObject) -> Option<T> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        info!(cache = %cache.name(), "watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.try_next() => match next {
                    Ok(Some(ev)) => apply_event(&cache, ev, &convert),
                    Ok(None) => {
                        warn!(cache = %cache.name(), "watcher stream ended");
                        break;
                    }
                    Err(e) => {
                        counter!("ferry_watch_errors_total", 1u64);
                        warn!(cache = %cache.name(), error = %e, "watch error");
                    }
                },
            }
        }
        info!(cache = %cache.name(), "watcher stopped");
    })
}

/// Watch objects of `ar`, cluster-wide or restricted to `namespace`.
pub fn watch_objects(client: Client, ar: &ApiResource, namespace: Option<&str>, cache: Arc<IndexedCache<DynamicObject>>, cancel: CancellationToken) -> JoinHandle<()> {
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client, ns, ar),
        None => Api::all_with(client, ar),
    };
    spawn_watcher(api, cache, Some, cancel)
}

/// Watch every service namespace record on a provider.
pub fn watch_service_namespaces(client: Client, cache: Arc<IndexedCache<ServiceNamespace>>, cancel: CancellationToken) -> JoinHandle<()> {
    let api: Api<DynamicObject> = Api::all_with(client, &service_namespace_resource());
    spawn_watcher(api, cache, |o| service_namespace_from_dynamic(&o), cancel)
}

/// Object transport for one bound resource type on one cluster.
pub struct KubeObjectStore {
    client: Client,
    ar: ApiResource,
}

impl KubeObjectStore {
    pub fn new(client: Client, ar: ApiResource) -> Self { Self { client, ar } }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.ar),
            None => Api::all_with(self.client.clone(), &self.ar),
        }
    }

    fn typed(&self, obj: &DynamicObject) -> DynamicObject {
        let mut o = obj.clone();
        o.types = Some(TypeMeta { api_version: self.ar.api_version.clone(), kind: self.ar.kind.clone() });
        o
    }

    fn name(obj: &DynamicObject) -> Result<&str, SyncError> {
        obj.metadata.name.as_deref().ok_or_else(|| SyncError::Malformed("object has no name".into()))
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeObjectStore {
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, SyncError> {
        self.api(obj.metadata.namespace.as_deref()).create(&PostParams::default(), &self.typed(obj)).await.map_err(map_kube_error)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, SyncError> {
        let name = Self::name(obj)?;
        self.api(obj.metadata.namespace.as_deref())
            .replace(name, &PostParams::default(), &self.typed(obj))
            .await
            .map_err(map_kube_error)
    }

    async fn apply(&self, obj: &DynamicObject, field_manager: &str) -> Result<DynamicObject, SyncError> {
        let name = Self::name(obj)?;
        let pp = PatchParams::apply(field_manager).force();
        self.api(obj.metadata.namespace.as_deref())
            .patch(name, &pp, &Patch::Apply(&self.typed(obj)))
            .await
            .map_err(map_kube_error)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), SyncError> {
        self.api(key.namespace.as_deref()).delete(&key.name, &DeleteParams::default()).await.map(|_| ()).map_err(map_kube_error)
    }
}

/// Service namespace transport on one provider.
pub struct KubeServiceNamespaceStore {
    client: Client,
}

impl KubeServiceNamespaceStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &service_namespace_resource())
    }
}

#[async_trait::async_trait]
impl ServiceNamespaceStore for KubeServiceNamespaceStore {
    async fn create(&self, sn: &ServiceNamespace) -> Result<ServiceNamespace, SyncError> {
        let created = self.api(&sn.namespace).create(&PostParams::default(), &service_namespace_to_dynamic(sn)).await.map_err(map_kube_error)?;
        service_namespace_from_dynamic(&created).ok_or_else(|| SyncError::Internal("created service namespace lacks identity".into()))
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ServiceNamespace>, SyncError> {
        let got = self.api(namespace).get_opt(name).await.map_err(map_kube_error)?;
        Ok(got.as_ref().and_then(service_namespace_from_dynamic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: format!("{} happened", reason), reason: reason.into(), code })
    }

    #[test]
    fn kube_errors_map_to_taxonomy() {
        assert!(map_kube_error(api_err(404, "NotFound")).is_not_found());
        assert!(map_kube_error(api_err(409, "AlreadyExists")).is_already_exists());
        assert!(matches!(map_kube_error(api_err(409, "Conflict")), SyncError::Conflict(_)));
        assert!(matches!(map_kube_error(api_err(500, "InternalError")), SyncError::Transport(_)));
    }

    #[test]
    fn service_namespace_dynamic_conversion() {
        let mut obj = service_namespace_to_dynamic(&ServiceNamespace::new("kube-bind-p1", "team-a"));
        assert_eq!(obj.types.as_ref().map(|t| t.api_version.as_str()), Some("ferry.dev/v1alpha1"));
        assert_eq!(service_namespace_from_dynamic(&obj).and_then(|s| s.upstream_namespace), None);

        obj.data["status"] = serde_json::json!({ "namespace": "kube-bind-p1-team-a" });
        let sn = service_namespace_from_dynamic(&obj).expect("identity");
        assert_eq!(sn.name, "team-a");
        assert_eq!(sn.ready_namespace(), Some("kube-bind-p1-team-a"));
    }

    #[test]
    fn service_namespace_without_namespace_is_rejected() {
        let mut obj = service_namespace_to_dynamic(&ServiceNamespace::new("owner", "x"));
        obj.metadata.namespace = None;
        assert!(service_namespace_from_dynamic(&obj).is_none());
    }
}
