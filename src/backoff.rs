//! Reconnect backoff for long-lived background connections.
//!
//! Used by the control listener when its subscription drops and by bridge clients
//! when the bridge connection fails. Attempt `0` is the first try (no delay); retries
//! start at `attempt = 1` and double until the cap.
//!
//! ```rust
//! use std::time::Duration;
//! use sluice::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(9), Duration::from_secs(2));
//! ```

use std::time::Duration;

/// Hard ceiling applied when a computation would overflow (1 hour).
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

/// Exponential backoff with an optional cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Delays of `base * 2^(attempt-1)`.
    pub fn exponential(base: Duration) -> Self {
        Self { base, max: None }
    }

    /// Cap every delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    /// Delay before the given attempt (0 = initial try, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base.as_nanos().saturating_mul(multiplier).min(MAX_BACKOFF.as_nanos());
        let delay = Duration::from_nanos(nanos as u64);
        self.max.map(|m| delay.min(m)).unwrap_or(delay).min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    /// 250ms doubling up to 30s.
    fn default() -> Self {
        Self { base: Duration::from_millis(250), max: Some(Duration::from_secs(30)) }
    }
}
