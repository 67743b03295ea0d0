//! Distributed leaky bucket.
//!
//! Each bucket is one key in the shared store holding `{level, last_update}`. The level drains
//! at `refill_rate` units per second; a request adds `cost` and is rejected if that would push
//! the level past `capacity`.
//!
//! Updates use optimistic concurrency: read, compute, then compare-and-swap against the state
//! that was read. A lost race re-reads and retries, up to `max_attempts`. Rejections never
//! write, so a denied request leaves the bucket exactly as it was.

use crate::error::StoreError;
use crate::store::{bounded, BucketState, SharedStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Tolerance for floating-point comparisons against capacity.
const EPSILON: f64 = 1e-9;

/// Result of one bucket check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BucketVerdict {
    /// The charge was recorded.
    Accepted {
        /// Further requests of the same cost that would fit right now.
        remaining: u64,
    },
    /// The request does not fit; nothing was written.
    Rejected {
        /// Whole seconds the client should wait, rounded up.
        retry_after: u64,
        /// Wall-clock second at which the request would fit.
        next_allowed: f64,
    },
}

impl BucketVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, BucketVerdict::Accepted { .. })
    }
}

/// What the engine does when the store cannot give a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum FailurePolicy {
    /// Deny with the failure status and this retry hint.
    FailClosed {
        #[serde(default = "default_failure_retry_after")]
        retry_after: u64,
    },
    /// Admit the request unchecked.
    FailOpen,
}

fn default_failure_retry_after() -> u64 {
    1
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::FailClosed { retry_after: default_failure_retry_after() }
    }
}

/// Check-and-update front end over a [`SharedStore`].
#[derive(Debug, Clone)]
pub struct BucketStore {
    store: Arc<dyn SharedStore>,
    timeout: Duration,
    max_attempts: usize,
    ttl: bool,
}

impl BucketStore {
    /// Defaults: 1s per store operation, 5 attempts, expiry hints on.
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store, timeout: Duration::from_secs(1), max_attempts: 5, ttl: true }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Read-modify-write attempts before giving up with [`StoreError::Contention`].
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Whether accepted writes carry an expiry hint for idle buckets.
    pub fn with_ttl(mut self, ttl: bool) -> Self {
        self.ttl = ttl;
        self
    }

    /// Charge `cost` against the bucket at `key`.
    ///
    /// * `capacity`: maximum level (the limit's `value`).
    /// * `refill_rate`: units drained per second (`value / unit`).
    /// * `now`: wall-clock seconds.
    ///
    /// Errors are transient store failures; the caller applies its [`FailurePolicy`].
    pub async fn check_and_update(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        cost: f64,
        now: f64,
    ) -> Result<BucketVerdict, StoreError> {
        // heavier than the whole bucket: fits an empty one only
        let cost = cost.min(capacity);
        for attempt in 1..=self.max_attempts {
            let current = bounded(self.timeout, self.store.get_bucket(key)).await?;
            let (level, last_update) = current.map_or((0.0, now), |s| (s.level, s.last_update));

            // clocks across nodes are not perfectly aligned; never drain backwards
            let elapsed = (now - last_update).max(0.0);
            let drained = (level - refill_rate * elapsed).max(0.0);
            let excess = drained + cost - capacity;

            if excess > EPSILON {
                let wait = excess / refill_rate;
                return Ok(BucketVerdict::Rejected {
                    retry_after: wait.ceil().max(1.0) as u64,
                    next_allowed: now + wait,
                });
            }

            // a lagging clock must not move last_update backwards, or the next reader
            // drains the same interval twice
            let next = BucketState { level: drained + cost, last_update: now.max(last_update) };
            let expire_at = self.ttl.then(|| (next.last_update + next.level / refill_rate).ceil());
            let written = bounded(
                self.timeout,
                self.store.cas_bucket(key, current, next, expire_at),
            )
            .await?;
            if written {
                let remaining = if cost > 0.0 {
                    ((capacity - next.level) / cost + EPSILON).floor().max(0.0) as u64
                } else {
                    u64::MAX
                };
                return Ok(BucketVerdict::Accepted { remaining });
            }
            debug!(target: "sluice::bucket", key, attempt, "bucket update lost a race; retrying");
        }

        Err(StoreError::Contention { key: key.to_string(), attempts: self.max_attempts })
    }
}
