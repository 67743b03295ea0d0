//! Shared store abstraction.
//!
//! Every node in the fleet talks to one external key-value store that offers:
//! - atomic compare-and-swap on single keys (bucket state),
//! - an ordered collection holding the serialized limit rule set,
//! - publish/subscribe channels for control and error messages,
//! - a set primitive for de-duplicated error records.
//!
//! [`MemoryStore`] implements the contract in-process for tests and single-node use;
//! production backends implement [`SharedStore`] over their client library.

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod memory;
pub use memory::MemoryStore;

/// Persisted state of one leaky bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Current water level, in request-cost units.
    pub level: f64,
    /// Wall-clock seconds of the last accepted charge.
    pub last_update: f64,
}

/// A live subscription to one pub/sub channel.
///
/// Backends feed received payloads into the sender half; the stream ends when the
/// backend drops it (connection lost, store shut down).
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    /// Create a subscription plus the sender a backend uses to deliver messages.
    pub fn channel(name: impl Into<String>) -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { channel: name.into(), rx })
    }

    /// Channel this subscription listens on.
    pub fn name(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the backend closed the subscription.
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Storage and messaging contract required by the engine.
#[async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
    /// Fetch the bucket state stored under `key`.
    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>, StoreError>;

    /// Replace the bucket state only if it still equals `expected`.
    ///
    /// * `expected`: the state read before computing `new`; `None` means the key was absent.
    /// * `expire_at`: optional wall-clock second after which the store may drop the key.
    ///
    /// Returns `Ok(true)` if the write happened, `Ok(false)` on a lost race.
    async fn cas_bucket(
        &self,
        key: &str,
        expected: Option<BucketState>,
        new: BucketState,
        expire_at: Option<f64>,
    ) -> Result<bool, StoreError>;

    /// All serialized limit entries under `key`, in ascending priority order.
    async fn limit_entries(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Atomically replace the ordered limit collection under `key`.
    async fn put_limits(&self, key: &str, entries: Vec<Vec<u8>>) -> Result<(), StoreError>;

    /// Publish `message` on `channel`; returns the number of receivers reached.
    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError>;

    /// Subscribe to `channel`. `shard_hint` is passed through opaquely to backends that
    /// pick pub/sub connections by shard; others ignore it.
    async fn subscribe(
        &self,
        channel: &str,
        shard_hint: Option<&str>,
    ) -> Result<Subscription, StoreError>;

    /// Add `member` to the set stored under `key`.
    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError>;
}

/// Run a store operation under the connection-level timeout.
pub async fn bounded<T, F>(timeout: Duration, op: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, op).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}
