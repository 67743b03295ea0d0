//! Per-request admission.
//!
//! [`Engine::admit`] walks the current snapshot in priority order. Every limit the request
//! matches is charged; the first one that rejects ends the walk with a [`Verdict::Denied`].

use crate::bucket::{BucketStore, BucketVerdict, FailurePolicy};
use crate::clock::{Clock, SystemClock};
use crate::snapshot::SnapshotCell;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Status line sent with rate-limit denials.
pub const DEFAULT_STATUS: &str = "413 Request Entity Too Large";
/// Status line sent when the store failed and the policy is fail-closed.
pub const DEFAULT_FAILURE_STATUS: &str = "503 Service Unavailable";

/// What the engine needs to know about a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
    /// Values attached by the host's preprocessing (identity, tenant, ...).
    pub context: BTreeMap<String, String>,
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self { method: method.into(), path: path.into(), ..Self::default() }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Names of the query arguments present.
    pub fn query_names(&self) -> HashSet<&str> {
        self.query
            .as_deref()
            .map(|q| {
                q.split('&')
                    .filter(|arg| !arg.is_empty())
                    .map(|arg| arg.split_once('=').map_or(arg, |(name, _)| name))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A client-visible rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    /// Status line, e.g. `413 Request Entity Too Large`.
    pub status: String,
    /// Seconds before the client should retry.
    pub retry_after: u64,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Denial {
    /// A bare denial carrying only the `Retry-After` header.
    pub fn new(status: impl Into<String>, retry_after: u64) -> Self {
        Self {
            status: status.into(),
            retry_after,
            headers: vec![("Retry-After".to_string(), retry_after.to_string())],
            body: String::new(),
        }
    }

    /// Numeric status code, if the status line starts with one.
    pub fn status_code(&self) -> Option<u16> {
        self.status.split_whitespace().next()?.parse().ok()
    }
}

/// Outcome of [`Engine::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Let the request through.
    Admitted {
        /// Smallest remaining capacity among the charged limits; `None` if nothing matched
        /// or the store was bypassed.
        remaining: Option<u64>,
    },
    Denied(Denial),
}

impl Verdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Verdict::Admitted { .. })
    }
}

/// Admission facade over a node's snapshot and the shared buckets.
#[derive(Debug, Clone)]
pub struct Engine {
    cell: SnapshotCell,
    buckets: BucketStore,
    clock: Arc<dyn Clock>,
    status: String,
    failure_status: String,
    policy: FailurePolicy,
}

impl Engine {
    pub fn new(cell: SnapshotCell, buckets: BucketStore) -> Self {
        Self {
            cell,
            buckets,
            clock: Arc::new(SystemClock),
            status: DEFAULT_STATUS.to_string(),
            failure_status: DEFAULT_FAILURE_STATUS.to_string(),
            policy: FailurePolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_failure_status(mut self, status: impl Into<String>) -> Self {
        self.failure_status = status.into();
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn snapshot_cell(&self) -> &SnapshotCell {
        &self.cell
    }

    /// Decide whether `request` may proceed.
    ///
    /// One snapshot is used for the whole request, so a concurrent reload never mixes two
    /// limit sets.
    pub async fn admit(&self, request: &Request) -> Verdict {
        let snapshot = self.cell.load();
        let now = self.clock.now_secs();
        let mut remaining: Option<u64> = None;

        for limit in snapshot.limits() {
            let Some(hit) = limit.matches(request) else {
                continue;
            };
            let record = limit.record();
            let key = hit.key.to_string();
            let checked = self
                .buckets
                .check_and_update(&key, record.capacity(), record.refill_rate(), hit.cost, now)
                .await;

            match checked {
                Ok(BucketVerdict::Accepted { remaining: left }) => {
                    debug!(target: "sluice::engine", %key, remaining = left, "charged");
                    remaining = Some(remaining.map_or(left, |r| r.min(left)));
                }
                Ok(BucketVerdict::Rejected { retry_after, next_allowed }) => {
                    info!(
                        target: "sluice::engine",
                        method = %request.method,
                        path = %request.path,
                        %key,
                        retry_after,
                        "request rate-limited"
                    );
                    return Verdict::Denied(limit.class().format(
                        record,
                        &self.status,
                        retry_after,
                        next_allowed,
                    ));
                }
                Err(e) => match self.policy {
                    FailurePolicy::FailOpen => {
                        warn!(target: "sluice::engine", %key, error = %e, "store unavailable; admitting unchecked");
                    }
                    FailurePolicy::FailClosed { retry_after } => {
                        warn!(target: "sluice::engine", %key, error = %e, "store unavailable; denying");
                        return Verdict::Denied(Denial::new(self.failure_status.clone(), retry_after));
                    }
                },
            }

            if !record.continue_scan {
                break;
            }
        }

        Verdict::Admitted { remaining }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::limit::{ClassRegistry, LimitRecord};
    use crate::matcher::Limit;
    use crate::snapshot::Snapshot;
    use crate::store::MemoryStore;
    use crate::unit::TimeUnit;

    fn engine(store: &MemoryStore, clock: &Arc<ManualClock>, records: Vec<LimitRecord>) -> Engine {
        let classes = ClassRegistry::new();
        let limits = records.into_iter().map(|r| Limit::compile(r, &classes).unwrap()).collect();
        let cell = SnapshotCell::new();
        cell.store(Snapshot::new(1, "test", limits));
        Engine::new(cell, BucketStore::new(Arc::new(store.clone()))).with_clock(clock.clone())
    }

    fn page_limit() -> LimitRecord {
        LimitRecord::new("/page/{pageid}", 10, TimeUnit::SECOND)
            .with_verbs(["GET"])
            .with_requirement("pageid", "[0-9]+")
    }

    #[test]
    fn query_names_ignore_values() {
        let req = Request::new("GET", "/").with_query("a=1&b&c=x=y&");
        assert_eq!(req.query_names(), HashSet::from(["a", "b", "c"]));
        assert!(Request::new("GET", "/").query_names().is_empty());
    }

    #[tokio::test]
    async fn eleventh_request_in_a_second_is_denied() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(1_000.0));
        let engine = engine(&store, &clock, vec![page_limit()]);
        let req = Request::new("GET", "/page/1");

        for _ in 0..10 {
            assert!(engine.admit(&req).await.is_admitted());
        }
        match engine.admit(&req).await {
            Verdict::Denied(denial) => {
                assert_eq!(denial.status, DEFAULT_STATUS);
                assert_eq!(denial.status_code(), Some(413));
                assert!(denial.retry_after >= 1);
            }
            other => panic!("expected denial, got {other:?}"),
        }
        // other pages have their own bucket
        assert!(engine.admit(&Request::new("GET", "/page/2")).await.is_admitted());
    }

    #[tokio::test]
    async fn unmatched_requests_pass_without_touching_the_store() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(0.0));
        let engine = engine(&store, &clock, vec![page_limit()]);
        store.set_down(true);
        let verdict = engine.admit(&Request::new("GET", "/page/abc")).await;
        assert_eq!(verdict, Verdict::Admitted { remaining: None });
    }

    #[tokio::test]
    async fn every_matching_limit_is_charged_until_a_rejection() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(0.0));
        let broad = LimitRecord::new("/page/{pageid}", 100, TimeUnit::MINUTE).with_uuid("broad");
        let narrow = LimitRecord::new("/page/{id}", 1, TimeUnit::MINUTE).with_verbs(["POST"]);
        let engine = engine(&store, &clock, vec![broad, narrow]);

        let verdict = engine.admit(&Request::new("POST", "/page/1")).await;
        assert_eq!(verdict, Verdict::Admitted { remaining: Some(0) });
        assert!(!engine.admit(&Request::new("POST", "/page/1")).await.is_admitted());
        // both POSTs were charged against the broad limit (the second before the rejection)
        let key = "bucket:limit:%2fpage%2f{pageid}/pageid=\"1\"";
        assert_eq!(store.bucket(key).map(|s| s.level), Some(2.0));
    }

    #[tokio::test]
    async fn continue_scan_false_stops_the_walk() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(0.0));
        let first = LimitRecord::new("/a", 5, TimeUnit::MINUTE).with_continue_scan(false);
        let second = LimitRecord::new("/{any}", 1, TimeUnit::MINUTE);
        let engine = engine(&store, &clock, vec![first, second]);

        for _ in 0..5 {
            assert!(engine.admit(&Request::new("GET", "/a")).await.is_admitted());
        }
        assert!(!engine.admit(&Request::new("GET", "/a")).await.is_admitted());
    }

    #[tokio::test]
    async fn denial_clears_after_retry_after() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(50.0));
        let engine = engine(&store, &clock, vec![LimitRecord::new("/x", 2, TimeUnit::MINUTE)]);
        let req = Request::new("GET", "/x");
        engine.admit(&req).await;
        engine.admit(&req).await;
        let Verdict::Denied(denial) = engine.admit(&req).await else {
            panic!("expected denial");
        };
        assert_eq!(denial.retry_after, 30);
        assert!(denial.body.contains("Please retry your request after"));
        clock.advance(denial.retry_after as f64);
        assert!(engine.admit(&req).await.is_admitted());
    }

    #[tokio::test]
    async fn store_failures_follow_the_policy() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(0.0));
        let closed = engine(&store, &clock, vec![LimitRecord::new("/x", 2, TimeUnit::MINUTE)]);
        let open = closed.clone().with_failure_policy(FailurePolicy::FailOpen);
        store.set_down(true);

        let req = Request::new("GET", "/x");
        match closed.admit(&req).await {
            Verdict::Denied(denial) => {
                assert_eq!(denial.status, DEFAULT_FAILURE_STATUS);
                assert_eq!(denial.retry_after, 1);
            }
            other => panic!("expected fail-closed denial, got {other:?}"),
        }
        assert_eq!(open.admit(&req).await, Verdict::Admitted { remaining: None });
    }
}
