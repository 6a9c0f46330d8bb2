//! Deduplicating work queue with per-key serialization and rate-limited requeues.
//!
//! Keys sit in FIFO order and are never queued twice. A key handed out by [`WorkQueue::get`]
//! is "processing" until [`WorkQueue::done`]; adds that arrive meanwhile only mark it dirty, and
//! it is queued again exactly once when processing finishes.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::debug;

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemBackoff<K> {
    base: Duration,
    max: Duration,
    failures: FxHashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ItemBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max: max.max(base), failures: FxHashMap::default() } }

    /// Delay for the next retry of `key`; records one more failure.
    pub fn when(&mut self, key: &K) -> Duration {
        let n = self.failures.entry(key.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).map(|d| d.min(self.max)).unwrap_or(self.max)
    }

    pub fn forget(&mut self, key: &K) { self.failures.remove(key); }

    pub fn failures(&self, key: &K) -> u32 { self.failures.get(key).copied().unwrap_or(0) }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    name: String,
    state: Mutex<State<K>>,
    backoff: Mutex<ItemBackoff<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Display + 'static,
{
    pub fn new(name: impl Into<String>, backoff: ItemBackoff<K>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                shutting_down: false,
            }),
            backoff: Mutex::new(backoff),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str { &self.name }

    fn state(&self) -> std::sync::MutexGuard<'_, State<K>> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    fn limiter(&self) -> std::sync::MutexGuard<'_, ItemBackoff<K>> { self.backoff.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Number of keys waiting to be handed out (excludes keys being processed).
    pub fn len(&self) -> usize { self.state().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn is_shutting_down(&self) -> bool { self.state().shutting_down }

    pub fn add(&self, key: K) {
        {
            let mut st = self.state();
            if st.shutting_down || st.dirty.contains(&key) { return; }
            st.dirty.insert(key.clone());
            if st.processing.contains(&key) { return; }
            st.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed. Dropped if the queue shuts down first.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() { return; }
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(q) = weak.upgrade() { q.add(key); }
        });
    }

    /// Requeue after the key's current backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = self.limiter().when(&key);
        counter!("ferry_queue_requeues_total", 1u64);
        debug!(queue = %self.name, key = %key, delay_ms = delay.as_millis() as u64, "rate limited requeue");
        self.add_after(key, delay);
    }

    /// Clear the backoff history for `key`.
    pub fn forget(&self, key: &K) { self.limiter().forget(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.limiter().failures(key) }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state();
                if st.shutting_down { return None; }
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as processed; requeues it if it was added while in flight.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut st = self.state();
            st.processing.remove(key);
            if st.dirty.contains(key) && !st.shutting_down {
                st.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued { self.notify.notify_one(); }
    }

    /// Stop handing out keys and wake every waiter.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
        debug!(queue = %self.name, "queue shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<String>> {
        WorkQueue::new("test", ItemBackoff::new(Duration::from_millis(5), Duration::from_secs(1)))
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = ItemBackoff::new(Duration::from_millis(5), Duration::from_millis(30));
        let k = "a".to_string();
        assert_eq!(b.when(&k), Duration::from_millis(5));
        assert_eq!(b.when(&k), Duration::from_millis(10));
        assert_eq!(b.when(&k), Duration::from_millis(20));
        assert_eq!(b.when(&k), Duration::from_millis(30));
        for _ in 0..64 { b.when(&k); }
        assert_eq!(b.when(&k), Duration::from_millis(30));
        b.forget(&k);
        assert_eq!(b.failures(&k), 0);
        assert_eq!(b.when(&k), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let q = queue();
        q.add("a".into());
        q.add("b".into());
        q.add("a".into());
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn burst_while_in_flight_requeues_once() {
        let q = queue();
        q.add("k".into());
        let k = q.get().await.expect("key");
        for _ in 0..50 { q.add("k".into()); }
        // in flight: not handed out again until done
        assert_eq!(q.len(), 0);
        q.done(&k);
        assert_eq!(q.len(), 1);
        let again = q.get().await.expect("requeued");
        q.done(&again);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters_and_refuses_adds() {
        let q = queue();
        let waiter = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.get().await }
        });
        tokio::task::yield_now().await;
        q.shut_down();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("waiter woke").expect("join");
        assert!(got.is_none());
        q.add("late".into());
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_fires_once_delay_elapses() {
        let q = queue();
        q.add_after("later".into(), Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_requeue_tracks_failures() {
        let q = queue();
        let k = "flaky".to_string();
        q.add_rate_limited(k.clone());
        q.add_rate_limited(k.clone());
        assert_eq!(q.num_requeues(&k), 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(q.len(), 1);
        q.forget(&k);
        assert_eq!(q.num_requeues(&k), 0);
    }
}
