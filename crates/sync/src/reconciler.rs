//! One reconciliation pass for a downstream key.
//!
//! Every pass starts from the current cache contents; nothing is carried over between passes,
//! so a pass can be repeated at any time, including after a crash.

use std::sync::Arc;
use std::time::Duration;

use ferry_core::{meta, Lister, ObjectKey, ObjectStore, Readiness, ResourceDescriptor, SyncError, DOWNSTREAM_FINALIZER};
use kube::core::{DynamicObject, ObjectMeta};
use tracing::{debug, info};

use crate::mapper::ensure_mapping;
use crate::provider::ProviderTarget;
use crate::resolver::ProviderResolver;
use crate::scope::ClusterScope;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The downstream object is gone.
    Absent,
    Created,
    Updated,
    /// Provider-amended fields were copied to the downstream object.
    PulledCorrection,
    InSync,
    /// A dependency is not observable yet; run again after the delay.
    Requeue(Duration),
    AwaitingUpstreamDeletion,
    Finalized,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Absent => "absent",
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::PulledCorrection => "pulled_correction",
            Outcome::InSync => "in_sync",
            Outcome::Requeue(_) => "requeue",
            Outcome::AwaitingUpstreamDeletion => "awaiting_upstream_deletion",
            Outcome::Finalized => "finalized",
        }
    }
}

/// Where the upstream counterpart of a downstream object lives.
enum Placement {
    Namespaced(String),
    Cluster(ClusterScope),
}

impl Placement {
    fn upstream_key(&self, name: &str) -> ObjectKey {
        match self {
            Placement::Namespaced(ns) => ObjectKey::namespaced(ns.clone(), name),
            Placement::Cluster(scope) => scope.upstream_key(name),
        }
    }

    fn place(&self, obj: &mut DynamicObject) -> Result<(), SyncError> {
        match self {
            Placement::Namespaced(ns) => {
                obj.metadata.namespace = Some(ns.clone());
                Ok(())
            }
            Placement::Cluster(scope) => scope.to_upstream(obj),
        }
    }

    fn read_back(&self, obj: &DynamicObject) -> Result<DynamicObject, SyncError> {
        match self {
            Placement::Namespaced(_) => Ok(obj.clone()),
            Placement::Cluster(scope) => scope.from_upstream(obj),
        }
    }
}

pub struct Reconciler {
    descriptor: ResourceDescriptor,
    downstream: Arc<dyn Lister<DynamicObject>>,
    consumer: Arc<dyn ObjectStore>,
    resolver: ProviderResolver,
    field_manager: String,
    not_ready_delay: Duration,
}

impl Reconciler {
    pub fn new(
        descriptor: ResourceDescriptor,
        downstream: Arc<dyn Lister<DynamicObject>>,
        consumer: Arc<dyn ObjectStore>,
        resolver: ProviderResolver,
        field_manager: impl Into<String>,
        not_ready_delay: Duration,
    ) -> Self {
        Self { descriptor, downstream, consumer, resolver, field_manager: field_manager.into(), not_ready_delay }
    }

    pub fn descriptor(&self) -> &ResourceDescriptor { &self.descriptor }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, SyncError> {
        let Some(current) = self.downstream.get(key) else {
            debug!(key = %key, "downstream object disappeared");
            return Ok(Outcome::Absent);
        };
        let resolution = self.resolver.resolve(&current)?;
        let target = Arc::clone(&resolution.target);

        let placement = match &key.namespace {
            Some(ns) => match ensure_mapping(&target, ns).await? {
                Readiness::Ready(upstream) => Placement::Namespaced(upstream),
                // nothing can exist upstream yet
                Readiness::Pending if meta::is_deleting(&current) => return self.release(key, &current).await,
                Readiness::Pending => {
                    info!(key = %key, provider = %target.cluster_id, "waiting for service namespace");
                    return Ok(Outcome::Requeue(self.not_ready_delay));
                }
            },
            None => Placement::Cluster(target.scope()),
        };

        if meta::is_deleting(&current) {
            return self.finalize(key, &target, &placement, &current).await;
        }

        let mut obj = (*current).clone();
        let mut claim = resolution.apply_to(&mut obj);
        claim |= meta::add_finalizer(&mut obj, DOWNSTREAM_FINALIZER);
        if claim {
            obj = self.consumer.update(&obj).await?;
            info!(key = %key, provider = %target.cluster_id, "downstream object claimed");
        }

        let upstream_key = placement.upstream_key(&key.name);
        match target.objects.get(&upstream_key) {
            Some(up) => {
                let upstream = placement.read_back(&up)?;
                self.converge(key, &target, &placement, obj, &upstream).await
            }
            None => {
                let mut up = obj;
                meta::strip_server_fields(&mut up);
                placement.place(&mut up)?;
                target.transport().objects.create(&up).await?;
                info!(key = %key, provider = %target.cluster_id, upstream = %upstream_key, "created upstream object");
                Ok(Outcome::Created)
            }
        }
    }

    /// Pull provider-amended fields down, then push the rest of the spec up.
    async fn converge(
        &self,
        key: &ObjectKey,
        target: &ProviderTarget,
        placement: &Placement,
        mut obj: DynamicObject,
        upstream: &DynamicObject,
    ) -> Result<Outcome, SyncError> {
        let fields = &self.descriptor.provider_fields;
        let mut outcome = Outcome::InSync;

        let corrections: Vec<&String> = fields
            .iter()
            .filter(|f| meta::spec_field(upstream, f).is_some_and(|v| meta::spec_field(&obj, f) != Some(v)))
            .collect();
        if !corrections.is_empty() {
            for f in &corrections {
                meta::set_spec_field(&mut obj, f, meta::spec_field(upstream, f).cloned());
            }
            obj = self.consumer.update(&obj).await?;
            info!(key = %key, provider = %target.cluster_id, fields = ?corrections, "pulled provider corrections downstream");
            outcome = Outcome::PulledCorrection;
        }

        // provider-side defaults on fields we never set do not count as drift
        let want = meta::spec_without(&obj, fields);
        let in_sync = match &want {
            None => true,
            Some(w) => meta::spec_without(upstream, fields).is_some_and(|have| meta::covers(&have, w)),
        };
        if in_sync {
            return Ok(outcome);
        }
        let mut patch = DynamicObject {
            types: obj.types.clone(),
            metadata: ObjectMeta {
                name: obj.metadata.name.clone(),
                namespace: obj.metadata.namespace.clone(),
                labels: obj.metadata.labels.clone(),
                annotations: obj.metadata.annotations.clone(),
                ..Default::default()
            },
            data: match want {
                Some(spec) => serde_json::json!({ "spec": spec }),
                None => serde_json::json!({}),
            },
        };
        placement.place(&mut patch)?;
        let applied = target.transport().objects.apply(&patch, &self.field_manager).await?;
        let applied = placement.read_back(&applied)?;
        info!(
            key = %key,
            provider = %target.cluster_id,
            rv = applied.metadata.resource_version.as_deref().unwrap_or(""),
            "applied spec upstream"
        );
        Ok(Outcome::Updated)
    }

    /// Downstream deletion: remove the upstream copy, then let go of the downstream object.
    async fn finalize(
        &self,
        key: &ObjectKey,
        target: &ProviderTarget,
        placement: &Placement,
        current: &DynamicObject,
    ) -> Result<Outcome, SyncError> {
        if !meta::has_finalizer(current, DOWNSTREAM_FINALIZER) {
            return Ok(Outcome::InSync);
        }
        let upstream_key = placement.upstream_key(&key.name);
        let owned = |up: &DynamicObject| placement.read_back(up).is_ok();

        // never delete a same-named object that belongs to someone else
        let foreign = target.objects.get(&upstream_key).is_some_and(|up| !owned(up.as_ref()));
        if !foreign {
            match target.transport().objects.delete(&upstream_key).await {
                Ok(()) => info!(key = %key, provider = %target.cluster_id, upstream = %upstream_key, "deleted upstream object"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if target.objects.get(&upstream_key).is_some_and(|up| owned(up.as_ref())) {
            debug!(key = %key, "waiting for upstream deletion");
            return Ok(Outcome::AwaitingUpstreamDeletion);
        }
        self.release(key, current).await
    }

    async fn release(&self, key: &ObjectKey, current: &DynamicObject) -> Result<Outcome, SyncError> {
        let mut obj = current.clone();
        if !meta::remove_finalizer(&mut obj, DOWNSTREAM_FINALIZER) {
            return Ok(Outcome::InSync);
        }
        match self.consumer.update(&obj).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        info!(key = %key, "downstream finalizer removed");
        Ok(Outcome::Finalized)
    }
}
