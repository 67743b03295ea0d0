//! Where background tasks wait.
//!
//! Deferred reloads and reconnect backoff sleep through [`Sleeper`] so tests can see which
//! delays were chosen without spending them.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub type SleepFuture = BoxFuture<'static, ()>;

pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> SleepFuture;
}

/// Sleeps on the tokio timer, so paused test time applies.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Returns at once and keeps a log of the delays it was asked for.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requested delays, oldest first.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        // still a yield point, so retry loops cannot starve the runtime
        Box::pin(tokio::task::yield_now())
    }
}
