//! Rebuilding the limit snapshot from the shared store.
//!
//! [`ReloadCoordinator::reload`] fetches every stored entry, skips (and reports) the ones that
//! fail to decode or compile, and publishes the rest as a new snapshot version.
//!
//! [`ReloadCoordinator::schedule_reload`] adds fleet-friendly timing. Spread reloads wait a
//! uniformly random delay so a broadcast `reload` does not make every node hit the store at
//! once. Overlapping requests coalesce to the earliest deadline:
//!
//! - a request due later than the pending one is dropped,
//! - a request due sooner replaces it,
//! - a reload that already started always runs to completion.

use crate::control::ErrorReporter;
use crate::error::StoreError;
use crate::jitter;
use crate::limit::{ClassRegistry, LimitRecord};
use crate::matcher::Limit;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::snapshot::{checksum, Snapshot, SnapshotCell};
use crate::store::{bounded, SharedStore};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// When a requested reload should run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReloadMode {
    /// Now, ignoring any configured spread.
    Immediate,
    /// After the configured default spread, or now if none is configured.
    Default,
    /// After a random delay in `[0, window)`.
    Spread(Duration),
}

/// What [`ReloadCoordinator::schedule_reload`] did with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Scheduled {
    /// Reloaded inline; carries the new version, or `None` if the reload failed.
    Ran(Option<u64>),
    /// A reload will run after this delay.
    Deferred(Duration),
    /// An earlier pending reload already covers this request.
    Coalesced,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    deadline: Instant,
    generation: u64,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn SharedStore>,
    cell: SnapshotCell,
    classes: ClassRegistry,
    reporter: ErrorReporter,
    limits_key: String,
    timeout: Duration,
    default_spread: Option<Duration>,
    sleeper: Arc<dyn Sleeper>,
    rng: Mutex<StdRng>,
    pending: Mutex<Option<Pending>>,
    next_generation: Mutex<u64>,
    running: tokio::sync::Mutex<()>,
}

/// Builder for [`ReloadCoordinator`].
#[derive(Debug)]
pub struct ReloadCoordinatorBuilder {
    store: Arc<dyn SharedStore>,
    cell: SnapshotCell,
    reporter: ErrorReporter,
    classes: ClassRegistry,
    limits_key: String,
    timeout: Duration,
    default_spread: Option<Duration>,
    sleeper: Arc<dyn Sleeper>,
    seed: Option<u64>,
}

impl ReloadCoordinatorBuilder {
    pub fn classes(mut self, classes: ClassRegistry) -> Self {
        self.classes = classes;
        self
    }

    pub fn limits_key(mut self, key: impl Into<String>) -> Self {
        self.limits_key = key.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Window used by [`ReloadMode::Default`]. Zero disables spreading.
    pub fn default_spread(mut self, spread: Option<Duration>) -> Self {
        self.default_spread = spread.filter(|s| !s.is_zero());
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Seed the spread RNG for reproducible delays.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> ReloadCoordinator {
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        ReloadCoordinator {
            inner: Arc::new(Inner {
                store: self.store,
                cell: self.cell,
                classes: self.classes,
                reporter: self.reporter,
                limits_key: self.limits_key,
                timeout: self.timeout,
                default_spread: self.default_spread,
                sleeper: self.sleeper,
                rng: Mutex::new(rng),
                pending: Mutex::new(None),
                next_generation: Mutex::new(0),
                running: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

/// Owns the reload policy for one node's [`SnapshotCell`].
#[derive(Debug, Clone)]
pub struct ReloadCoordinator {
    inner: Arc<Inner>,
}

impl ReloadCoordinator {
    /// Start building a coordinator that reads limits from `store` into `cell`.
    pub fn builder(
        store: Arc<dyn SharedStore>,
        cell: SnapshotCell,
        reporter: ErrorReporter,
    ) -> ReloadCoordinatorBuilder {
        ReloadCoordinatorBuilder {
            store,
            cell,
            reporter,
            classes: ClassRegistry::new(),
            limits_key: "limits".to_string(),
            timeout: Duration::from_secs(1),
            default_spread: None,
            sleeper: Arc::new(TokioSleeper),
            seed: None,
        }
    }

    pub fn cell(&self) -> &SnapshotCell {
        &self.inner.cell
    }

    /// Whether a deferred reload is waiting to run.
    pub fn has_pending(&self) -> bool {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Rebuild the snapshot from the store and publish it.
    ///
    /// Bad entries are reported one by one and left out. A store failure leaves the current
    /// snapshot in place.
    pub async fn reload(&self) -> Result<Arc<Snapshot>, StoreError> {
        self.inner.reload().await
    }

    /// Run or defer a reload according to `mode`.
    pub async fn schedule_reload(&self, mode: ReloadMode) -> Scheduled {
        let inner = &self.inner;
        let delay = {
            let mut rng = inner.rng.lock().unwrap_or_else(PoisonError::into_inner);
            match mode {
                ReloadMode::Immediate => Duration::ZERO,
                ReloadMode::Default => inner
                    .default_spread
                    .map(|window| jitter::spread_with_rng(window, &mut *rng))
                    .unwrap_or(Duration::ZERO),
                ReloadMode::Spread(window) => jitter::spread_with_rng(window, &mut *rng),
            }
        };
        let deadline = Instant::now() + delay;

        let generation = {
            let mut pending = inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(p) = *pending {
                if p.deadline <= deadline {
                    debug!(target: "sluice::reload", ?mode, "reload already pending sooner; coalesced");
                    return Scheduled::Coalesced;
                }
            }
            if delay.is_zero() {
                // runs now, which covers anything pending
                *pending = None;
                None
            } else {
                let mut next = inner.next_generation.lock().unwrap_or_else(PoisonError::into_inner);
                *next += 1;
                *pending = Some(Pending { deadline, generation: *next });
                Some(*next)
            }
        };

        let Some(generation) = generation else {
            let version = inner.reload_reporting().await;
            return Scheduled::Ran(version);
        };

        info!(target: "sluice::reload", delay_ms = delay.as_millis() as u64, "reload scheduled");
        let task = Arc::clone(inner);
        tokio::spawn(async move {
            task.sleeper.sleep(delay).await;
            if task.take_pending(generation) {
                task.reload_reporting().await;
            }
        });
        Scheduled::Deferred(delay)
    }
}

impl Inner {
    /// Clear the pending slot if it still belongs to `generation`.
    fn take_pending(&self, generation: u64) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match *pending {
            Some(p) if p.generation == generation => {
                *pending = None;
                true
            }
            _ => {
                debug!(target: "sluice::reload", generation, "scheduled reload superseded");
                false
            }
        }
    }

    async fn reload_reporting(&self) -> Option<u64> {
        match self.reload().await {
            Ok(snapshot) => Some(snapshot.version()),
            Err(e) => {
                error!(target: "sluice::reload", error = %e, "limit reload failed");
                self.reporter.report(&format!("Failed to reload limits: {}", e)).await;
                None
            }
        }
    }

    async fn reload(&self) -> Result<Arc<Snapshot>, StoreError> {
        // one reload at a time so versions stay monotonic
        let _running = self.running.lock().await;

        let entries = bounded(self.timeout, self.store.limit_entries(&self.limits_key)).await?;
        let sum = checksum(&entries);

        let mut limits = Vec::with_capacity(entries.len());
        for (idx, raw) in entries.iter().enumerate() {
            match LimitRecord::decode(raw).and_then(|record| Limit::compile(record, &self.classes)) {
                Ok(limit) => limits.push(limit),
                Err(e) => {
                    warn!(target: "sluice::reload", index = idx, error = %e, "skipping limit entry");
                    self.reporter.report(&format!("Failed to load limit entry {}: {}", idx, e)).await;
                }
            }
        }

        let previous = self.cell.load();
        if previous.version() > 0 && previous.checksum() == sum {
            info!(target: "sluice::reload", checksum = %sum, "limits unchanged");
        }
        let version = previous.version() + 1;
        info!(
            target: "sluice::reload",
            version,
            limits = limits.len(),
            skipped = entries.len() - limits.len(),
            "limits loaded"
        );
        self.cell.store(Snapshot::new(version, sum, limits));
        Ok(self.cell.load())
    }
}
