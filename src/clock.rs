//! Clock abstractions used by the leaky bucket and error reporting.
//!
//! Bucket state is shared by every node in the fleet, so timestamps are wall-clock
//! seconds since the Unix epoch rather than a per-process monotonic origin.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in fractional seconds since the Unix epoch.
    fn now_secs(&self) -> f64;
}

/// Wall clock backed by `SystemTime::now()`.
///
/// Notes: nodes are expected to run NTP; skew between nodes shows up as slightly
/// early or late draining, which the bucket arithmetic clamps rather than rejects.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or_default()
    }
}

/// Manually driven clock for deterministic tests.
///
/// Stores the time as raw `f64` bits so it can be shared across tasks without a lock.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start` seconds.
    pub fn new(start: f64) -> Self {
        Self { bits: AtomicU64::new(start.to_bits()) }
    }

    /// Jump to an absolute time.
    pub fn set(&self, secs: f64) {
        self.bits.store(secs.to_bits(), Ordering::SeqCst);
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: f64) {
        let now = self.now_secs();
        self.set(now + secs);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}
