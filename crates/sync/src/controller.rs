//! Worker pool draining the shared queue into the reconciler.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use ferry_core::{ErrorClass, Lister, ObjectKey, ObjectStore, ResourceDescriptor};
use ferry_store::{IndexedCache, ItemBackoff, WorkQueue};
use futures::FutureExt;
use kube::core::DynamicObject;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::provider::ProviderTarget;
use crate::reconciler::{Outcome, Reconciler};
use crate::resolver::ProviderResolver;
use crate::router;

pub struct Controller {
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<Reconciler>,
    workers: usize,
}

impl Controller {
    /// Wire the consumer cache and every provider's caches into one queue.
    pub fn new(
        descriptor: ResourceDescriptor,
        downstream: Arc<IndexedCache<DynamicObject>>,
        consumer: Arc<dyn ObjectStore>,
        targets: Vec<Arc<ProviderTarget>>,
        config: &ControllerConfig,
    ) -> Self {
        let queue = WorkQueue::new(descriptor.gvk_key(), ItemBackoff::new(config.backoff_base, config.backoff_max));
        router::register(&queue, &downstream, &targets, descriptor.namespaced);
        let lister: Arc<dyn Lister<DynamicObject>> = downstream;
        let reconciler = Reconciler::new(
            descriptor,
            lister,
            consumer,
            ProviderResolver::new(targets),
            config.field_manager.clone(),
            config.not_ready_delay,
        );
        Self { queue, reconciler: Arc::new(reconciler), workers: config.workers.max(1) }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> { &self.queue }
    pub fn reconciler(&self) -> &Arc<Reconciler> { &self.reconciler }

    /// Process one key. Returns false once the queue has shut down.
    pub async fn process_next(&self) -> bool { process_next(&self.queue, &self.reconciler).await }

    /// Run the workers until `cancel` fires; in-flight passes finish before this returns.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            handles.push(tokio::spawn(async move {
                while process_next(&queue, &reconciler).await {}
                debug!(worker, "worker stopped");
            }));
        }
        info!(workers = self.workers, resource = %self.reconciler.descriptor().gvk_key(), "controller started");
        cancel.cancelled().await;
        self.queue.shut_down();
        for h in handles {
            if let Err(e) = h.await {
                error!(error = %e, "worker task failed");
            }
        }
        info!("controller stopped");
    }
}

async fn process_next(queue: &Arc<WorkQueue<ObjectKey>>, reconciler: &Reconciler) -> bool {
    let Some(key) = queue.get().await else { return false };
    let started = Instant::now();
    let result = AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind().await;
    histogram!("ferry_reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
    match result {
        Ok(Ok(outcome)) => {
            counter!("ferry_reconcile_total", 1u64, "outcome" => outcome.label());
            queue.forget(&key);
            if let Outcome::Requeue(delay) = outcome {
                queue.add_after(key.clone(), delay);
            }
            debug!(key = %key, outcome = outcome.label(), "reconciled");
        }
        Ok(Err(err)) => {
            let class = match err.class() {
                ErrorClass::Transient => "transient",
                ErrorClass::Unroutable => "unroutable",
            };
            counter!("ferry_reconcile_errors_total", 1u64, "class" => class);
            warn!(key = %key, error = %err, class, retries = queue.num_requeues(&key), "reconcile failed");
            queue.add_rate_limited(key.clone());
        }
        Err(_) => {
            counter!("ferry_reconcile_errors_total", 1u64, "class" => "panic");
            error!(key = %key, "reconcile panicked");
            queue.add_rate_limited(key.clone());
        }
    }
    queue.done(&key);
    true
}
