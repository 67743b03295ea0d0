use super::{BucketState, SharedStore, Subscription};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct Inner {
    buckets: HashMap<String, (BucketState, Option<f64>)>,
    limits: HashMap<String, Vec<Vec<u8>>>,
    sets: HashMap<String, BTreeSet<String>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

/// In-process shared store.
///
/// Clones share the same data, so several simulated "nodes" can point at one
/// `MemoryStore` in tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    down: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while down, every store operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.lock()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// Inspect a bucket without going through the async API.
    pub fn bucket(&self, key: &str) -> Option<BucketState> {
        self.lock().ok()?.buckets.get(key).map(|(state, _)| *state)
    }

    /// Expiry hint recorded with the last write of `key`.
    pub fn bucket_expiry(&self, key: &str) -> Option<f64> {
        self.lock().ok()?.buckets.get(key).and_then(|(_, expire_at)| *expire_at)
    }

    /// Members of the set under `key`, sorted.
    pub fn set_members(&self, key: &str) -> Vec<String> {
        self.lock()
            .map(|g| g.sets.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Number of live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock()
            .map(|g| {
                g.subscribers.get(channel).map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            })
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    /// Drop every subscription, as if the pub/sub connection had been lost.
    pub fn disconnect_subscribers(&self) {
        if let Ok(mut guard) = self.lock() {
            guard.subscribers.clear();
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        Ok(self.check()?.buckets.get(key).map(|(state, _)| *state))
    }

    async fn cas_bucket(
        &self,
        key: &str,
        expected: Option<BucketState>,
        new: BucketState,
        expire_at: Option<f64>,
    ) -> Result<bool, StoreError> {
        let mut guard = self.check()?;
        let current = guard.buckets.get(key).map(|(state, _)| *state);
        if current != expected {
            return Ok(false);
        }
        guard.buckets.insert(key.to_string(), (new, expire_at));
        Ok(true)
    }

    async fn limit_entries(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self.check()?.limits.get(key).cloned().unwrap_or_default())
    }

    async fn put_limits(&self, key: &str, entries: Vec<Vec<u8>>) -> Result<(), StoreError> {
        self.check()?.limits.insert(key.to_string(), entries);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError> {
        let mut guard = self.check()?;
        let Some(subs) = guard.subscribers.get_mut(channel) else {
            return Ok(0);
        };
        subs.retain(|tx| tx.send(message.to_string()).is_ok());
        Ok(subs.len())
    }

    async fn subscribe(
        &self,
        channel: &str,
        _shard_hint: Option<&str>,
    ) -> Result<Subscription, StoreError> {
        let (tx, sub) = Subscription::channel(channel);
        self.check()?.subscribers.entry(channel.to_string()).or_default().push(tx);
        Ok(sub)
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check()?.sets.entry(key.to_string()).or_default().insert(member.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(level: f64, last_update: f64) -> BucketState {
        BucketState { level, last_update }
    }

    #[tokio::test]
    async fn cas_requires_matching_previous_state() {
        let store = MemoryStore::new();
        assert!(store.cas_bucket("k", None, state(1.0, 10.0), None).await.unwrap());
        // Stale expectation loses the race.
        assert!(!store.cas_bucket("k", None, state(2.0, 11.0), None).await.unwrap());
        assert!(store
            .cas_bucket("k", Some(state(1.0, 10.0)), state(2.0, 11.0), Some(13.0))
            .await
            .unwrap());
        assert_eq!(store.bucket("k"), Some(state(2.0, 11.0)));
        assert_eq!(store.bucket_expiry("k"), Some(13.0));
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let store = MemoryStore::new();
        let mut a = store.subscribe("control", None).await.unwrap();
        let mut b = store.subscribe("control", Some("shard-1")).await.unwrap();
        assert_eq!(store.publish("control", "reload").await.unwrap(), 2);
        assert_eq!(a.next().await.as_deref(), Some("reload"));
        assert_eq!(b.next().await.as_deref(), Some("reload"));
        assert_eq!(store.publish("elsewhere", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let store = MemoryStore::new();
        let sub = store.subscribe("control", None).await.unwrap();
        drop(sub);
        assert_eq!(store.publish("control", "ping").await.unwrap(), 0);
        assert_eq!(store.subscriber_count("control"), 0);
    }

    #[tokio::test]
    async fn outage_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_down(true);
        assert!(matches!(store.get_bucket("k").await, Err(StoreError::Unavailable(_))));
        assert!(store.publish("control", "x").await.is_err());
        store.set_down(false);
        assert_eq!(store.get_bucket("k").await, Ok(None));
    }

    #[tokio::test]
    async fn sets_deduplicate() {
        let store = MemoryStore::new();
        store.add_to_set("errors", "boom").await.unwrap();
        store.add_to_set("errors", "boom").await.unwrap();
        assert_eq!(store.set_members("errors"), vec!["boom".to_string()]);
    }

    #[tokio::test]
    async fn limits_keep_their_order() {
        let store = MemoryStore::new();
        store.put_limits("limits", vec![b"b".to_vec(), b"a".to_vec()]).await.unwrap();
        assert_eq!(store.limit_entries("limits").await.unwrap(), vec![b"b".to_vec(), b"a".to_vec()]);
        assert!(store.limit_entries("other").await.unwrap().is_empty());
    }
}
