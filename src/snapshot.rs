//! Versioned, immutable limit sets and the cell that publishes them.

use crate::matcher::Limit;
use crate::limit::LimitRecord;
use arc_swap::ArcSwap;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// One node's view of the ordered limit set.
///
/// Never mutated after construction; a reload builds a new one and swaps it in.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    version: u64,
    checksum: String,
    limits: Vec<Limit>,
}

impl Snapshot {
    pub fn new(version: u64, checksum: impl Into<String>, limits: Vec<Limit>) -> Self {
        Self { version, checksum: checksum.into(), limits }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// SHA-256 (hex) of the raw entries this snapshot was built from.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Limits in evaluation order.
    pub fn limits(&self) -> &[Limit] {
        &self.limits
    }

    /// The records behind [`limits`](Self::limits), for comparing content across versions.
    pub fn records(&self) -> Vec<&LimitRecord> {
        self.limits.iter().map(Limit::record).collect()
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

/// Checksum over the raw entry bytes, in order.
pub fn checksum(entries: &[Vec<u8>]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update((entry.len() as u64).to_be_bytes());
        hasher.update(entry);
    }
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Holder of the current snapshot.
///
/// Reads are lock-free; a request should call [`load`](Self::load) once and use that
/// snapshot throughout.
#[derive(Debug, Clone)]
pub struct SnapshotCell {
    inner: Arc<ArcSwap<Snapshot>>,
}

impl SnapshotCell {
    /// A cell holding the empty version-0 snapshot.
    pub fn new() -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(Snapshot::default())) }
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.inner.load_full()
    }

    /// Publish `snapshot` as the current one.
    pub fn store(&self, snapshot: Snapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}

impl Default for SnapshotCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limit::ClassRegistry;
    use crate::unit::TimeUnit;

    fn limit(uri: &str) -> Limit {
        Limit::compile(LimitRecord::new(uri, 1, TimeUnit::SECOND), &ClassRegistry::new()).unwrap()
    }

    #[test]
    fn readers_keep_their_snapshot_across_swaps() {
        let cell = SnapshotCell::new();
        assert_eq!(cell.load().version(), 0);
        assert!(cell.load().is_empty());

        let held = cell.load();
        cell.store(Snapshot::new(1, "abc", vec![limit("/a"), limit("/b")]));
        assert_eq!(held.version(), 0);
        let current = cell.load();
        assert_eq!(current.version(), 1);
        assert_eq!(current.len(), 2);
        assert_eq!(current.records()[1].uri_template, "/b");
    }

    #[test]
    fn checksum_depends_on_order_and_boundaries() {
        let a = checksum(&[b"ab".to_vec(), b"c".to_vec()]);
        assert_eq!(a.len(), 64);
        assert_eq!(a, checksum(&[b"ab".to_vec(), b"c".to_vec()]));
        assert_ne!(a, checksum(&[b"c".to_vec(), b"ab".to_vec()]));
        assert_ne!(a, checksum(&[b"a".to_vec(), b"bc".to_vec()]));
    }
}
