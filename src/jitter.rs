//! Randomized delays that keep a fleet from acting in lockstep.
//!
//! - `Spread`: uniform in `[0, window)`, used for fleet-wide reloads so every node does
//!   not hit the shared store at the same instant.
//! - `Jitter::Full`: uniform in `[0, delay]`, applied to reconnect backoff.
//!
//! RNG: `rand`'s thread-local RNG by default; deterministic RNGs can be injected via the
//! `*_with_rng` variants.

use rand::{rng, Rng};
use std::time::Duration;

/// Sample a delay uniformly from `[0, window)`.
///
/// A zero window yields a zero delay.
pub fn spread(window: Duration) -> Duration {
    spread_with_rng(window, &mut rng())
}

/// [`spread`] with a caller-provided RNG (for testing).
pub fn spread_with_rng<R: Rng>(window: Duration, rng: &mut R) -> Duration {
    let secs = window.as_secs_f64();
    if secs <= 0.0 || !secs.is_finite() {
        return Duration::ZERO;
    }
    let sampled = Duration::try_from_secs_f64(rng.random_range(0.0..secs)).unwrap_or(window);
    // nanosecond rounding can land on the open upper bound
    sampled.min(window.saturating_sub(Duration::from_nanos(1)))
}

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Full jitter: random between 0 and delay
    #[default]
    Full,
}

impl Jitter {
    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis: u64 = delay.as_millis().try_into().unwrap_or(u64::MAX);
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn spread_stays_inside_window() {
        let window = Duration::from_secs(10);
        for _ in 0..500 {
            let d = spread(window);
            assert!(d < window, "{d:?} escaped the window");
        }
    }

    #[test]
    fn spread_is_reproducible_with_seed() {
        let window = Duration::from_secs(10);
        let a = spread_with_rng(window, &mut StdRng::seed_from_u64(7));
        let b = spread_with_rng(window, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn zero_window_means_now() {
        assert_eq!(spread(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn full_jitter_is_between_zero_and_delay() {
        let delay = Duration::from_secs(1);
        for _ in 0..100 {
            assert!(Jitter::Full.apply(delay) <= delay);
        }
        assert_eq!(Jitter::None.apply(delay), delay);
        assert_eq!(Jitter::Full.apply(Duration::ZERO), Duration::ZERO);
    }
}
