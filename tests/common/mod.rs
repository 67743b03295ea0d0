#![allow(dead_code)]

use sluice::{
    encode_entries, BucketStore, ClassRegistry, Clock, Engine, Limit, LimitRecord, MemoryStore,
    SharedStore, Snapshot, SnapshotCell,
};
use std::sync::Arc;
use std::time::Duration;

pub fn shared(store: &MemoryStore) -> Arc<dyn SharedStore> {
    Arc::new(store.clone())
}

/// Replace the stored limit set under the default key.
pub async fn put_limits(store: &MemoryStore, records: &[LimitRecord]) {
    store.put_limits("limits", encode_entries(records).unwrap()).await.unwrap();
}

/// An engine over `store` with `records` already compiled into its snapshot.
pub fn engine(store: &MemoryStore, clock: Arc<dyn Clock>, records: Vec<LimitRecord>) -> Engine {
    let classes = ClassRegistry::new();
    let limits = records.into_iter().map(|r| Limit::compile(r, &classes).unwrap()).collect();
    let cell = SnapshotCell::new();
    cell.store(Snapshot::new(1, "fixture", limits));
    let buckets = BucketStore::new(shared(store)).with_max_attempts(1_000);
    Engine::new(cell, buckets).with_clock(clock)
}

/// Route `sluice` logs to the test output; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds, sleeping briefly in between.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    check()
}
