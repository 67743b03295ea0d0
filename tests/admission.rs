mod common;

use common::engine;
use sluice::{
    AdmissionLayer, Clock, FailurePolicy, LimitRecord, ManualClock, MemoryStore, Request, TimeUnit,
    Verdict,
};
use std::convert::Infallible;
use std::sync::Arc;
use tower::{service_fn, ServiceBuilder, ServiceExt};

fn page_limit() -> LimitRecord {
    LimitRecord::new("/page/{pageid}", 10, TimeUnit::SECOND)
        .with_verbs(["GET"])
        .with_requirement("pageid", "[0-9]+")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nodes_sharing_a_store_enforce_one_rate() {
    let store = MemoryStore::new();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_700_000_000.0));
    let nodes = [
        engine(&store, clock.clone(), vec![page_limit()]),
        engine(&store, clock.clone(), vec![page_limit()]),
    ];

    let tasks = (0..30).map(|i| {
        let node = nodes[i % 2].clone();
        tokio::spawn(async move { node.admit(&Request::new("GET", "/page/42")).await })
    });
    let verdicts = futures::future::join_all(tasks).await;
    let admitted = verdicts.into_iter().filter(|v| v.as_ref().unwrap().is_admitted()).count();
    assert_eq!(admitted, 10);
}

#[tokio::test]
async fn waiting_retry_after_is_enough() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::new(1_000.0));
    let node = engine(&store, clock.clone(), vec![LimitRecord::new("/search", 3, TimeUnit::MINUTE)]);
    let req = Request::new("GET", "/search");

    for _ in 0..3 {
        assert!(node.admit(&req).await.is_admitted());
    }
    clock.advance(5.0);
    let Verdict::Denied(denial) = node.admit(&req).await else {
        panic!("fourth request within a minute should be denied");
    };
    assert_eq!(denial.retry_after, 15);
    assert!(denial.headers.contains(&("Retry-After".to_string(), "15".to_string())));

    clock.advance(denial.retry_after as f64);
    assert!(node.admit(&req).await.is_admitted());
}

#[tokio::test]
async fn denied_requests_leave_the_bucket_alone() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::new(10.0));
    let node = engine(&store, clock.clone(), vec![LimitRecord::new("/x", 1, TimeUnit::HOUR)]);
    let req = Request::new("POST", "/x");
    assert!(node.admit(&req).await.is_admitted());

    let key = "bucket:limit:%2fx";
    let before = store.bucket(key).unwrap();
    for _ in 0..5 {
        clock.advance(1.0);
        assert!(!node.admit(&req).await.is_admitted());
    }
    assert_eq!(store.bucket(key), Some(before));
}

#[tokio::test]
async fn requirements_verbs_and_queries_narrow_the_match() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::new(0.0));
    let limits = vec![
        page_limit().with_continue_scan(false),
        LimitRecord::new("/feed", 1, TimeUnit::HOUR).with_queries(["since"]),
    ];
    let node = engine(&store, clock, limits);

    for _ in 0..20 {
        assert!(node.admit(&Request::new("GET", "/page/abc")).await.is_admitted());
        assert!(node.admit(&Request::new("DELETE", "/page/1")).await.is_admitted());
        assert!(node.admit(&Request::new("GET", "/feed").with_query("limit=5")).await.is_admitted());
    }
    let with_since = Request::new("GET", "/feed").with_query("since=10&limit=5");
    assert!(node.admit(&with_since).await.is_admitted());
    assert!(!node.admit(&with_since).await.is_admitted());
}

#[tokio::test]
async fn store_outage_follows_the_failure_policy() {
    let store = MemoryStore::new();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0.0));
    let closed = engine(&store, clock.clone(), vec![LimitRecord::new("/x", 5, TimeUnit::SECOND)]);
    let open = closed.clone().with_failure_policy(FailurePolicy::FailOpen);
    let req = Request::new("GET", "/x");

    store.set_down(true);
    let Verdict::Denied(denial) = closed.admit(&req).await else {
        panic!("fail-closed should deny while the store is down");
    };
    assert_eq!(denial.status_code(), Some(503));
    assert!(open.admit(&req).await.is_admitted());

    store.set_down(false);
    assert!(closed.admit(&req).await.is_admitted());
}

#[tokio::test]
async fn middleware_surfaces_denials() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::new(0.0));
    let node = engine(&store, clock, vec![LimitRecord::new("/api/{thing}", 2, TimeUnit::MINUTE)]);
    let svc = ServiceBuilder::new()
        .layer(AdmissionLayer::new(node))
        .service(service_fn(|req: Request| async move { Ok::<_, Infallible>(req.path.len()) }));

    assert_eq!(svc.clone().oneshot(Request::new("GET", "/api/a")).await.unwrap(), 6);
    assert_eq!(svc.clone().oneshot(Request::new("GET", "/api/a")).await.unwrap(), 6);
    let err = svc.clone().oneshot(Request::new("GET", "/api/a")).await.unwrap_err();
    let denial = err.denial().unwrap();
    assert_eq!(denial.status, "413 Request Entity Too Large");
    assert_eq!(denial.retry_after, 30);
    // a different placeholder value is a different bucket
    assert!(svc.oneshot(Request::new("GET", "/api/b")).await.is_ok());
}
