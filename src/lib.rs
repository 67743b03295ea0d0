#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Sluice
//!
//! Distributed rate-limit admission control for horizontally scaled API fleets.
//!
//! Every node keeps an immutable snapshot of the ordered limit set and charges matching
//! requests against leaky buckets held in a shared store. Bucket updates use
//! compare-and-swap, so the fleet enforces one rate per bucket no matter which node a
//! request lands on.
//!
//! ## Features
//!
//! - **URI template matching** with per-placeholder requirements, verb and query filters
//! - **Distributed leaky buckets** with optimistic concurrency and expiry hints
//! - **Lock-free snapshots** swapped atomically on reload
//! - **Control channel** for `ping` and (spread) `reload` over pub/sub
//! - **Control bridge** for workers that cannot subscribe directly
//! - **Tower middleware** wrapping any service
//!
//! ## Quick Start
//!
//! ```rust
//! use sluice::{encode_entries, Config, LimitRecord, MemoryStore, Node, Request, SharedStore, TimeUnit};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!     let limits = [LimitRecord::new("/page/{pageid}", 10, TimeUnit::SECOND).with_verbs(["GET"])];
//!     store.put_limits("limits", encode_entries(&limits).unwrap()).await.unwrap();
//!
//!     let node = Node::builder(Arc::new(store), Config::default()).start().await.unwrap();
//!     let verdict = node.engine().admit(&Request::new("GET", "/page/42")).await;
//!     assert!(verdict.is_admitted());
//!     node.shutdown().await;
//! }
//! ```

pub mod backoff;
pub mod bucket;
pub mod clock;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod jitter;
pub mod limit;
pub mod matcher;
pub mod middleware;
pub mod node;
pub mod reload;
pub mod sleeper;
pub mod snapshot;
pub mod store;
pub mod unit;

// Re-exports
pub use backoff::Backoff;
pub use bucket::{BucketStore, BucketVerdict, FailurePolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ControlConfig, RemoteConfig, StoreConfig};
pub use control::bridge::{
    BridgeClient, BridgeClientHandle, BridgeRelay, BridgeServer, BridgeServerHandle, ClientState,
};
pub use control::{
    send_command, CommandRegistry, ControlCommand, ControlHandler, ControlListener, ControlMessage,
    ErrorReporter, ListenerHandle, ListenerState, NodeControl,
};
pub use engine::{Denial, Engine, Request, Verdict};
pub use error::{AdmissionError, BridgeError, ConfigError, ControlError, StoreError};
pub use jitter::Jitter;
pub use limit::{encode_entries, BaseLimit, ClassRegistry, LimitClass, LimitEntry, LimitRecord};
pub use matcher::{BucketKey, Limit, Route};
pub use middleware::{AdmissionLayer, AdmissionRequest, AdmissionService};
pub use node::{ControlTask, Node, NodeBuilder};
pub use reload::{ReloadCoordinator, ReloadMode, Scheduled};
pub use sleeper::{RecordingSleeper, Sleeper, TokioSleeper};
pub use snapshot::{Snapshot, SnapshotCell};
pub use store::{MemoryStore, SharedStore, Subscription};
pub use unit::TimeUnit;
