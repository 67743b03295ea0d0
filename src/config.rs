//! Node configuration.
//!
//! Everything has a default, so `Config::default()` is a working local-mode setup and a JSON
//! document only needs the keys it changes.

use crate::bucket::{BucketStore, FailurePolicy};
use crate::engine::{DEFAULT_FAILURE_STATUS, DEFAULT_STATUS};
use crate::error::ConfigError;
use crate::store::SharedStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Status line for rate-limit denials.
    pub status: String,
    /// Status line for denials caused by an unusable store.
    pub failure_status: String,
    pub failure_policy: FailurePolicy,
    pub store: StoreConfig,
    pub control: ControlConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            status: DEFAULT_STATUS.to_string(),
            failure_status: DEFAULT_FAILURE_STATUS.to_string(),
            failure_policy: FailurePolicy::default(),
            store: StoreConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

impl Config {
    /// Parse and validate a JSON document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_json::from_str(raw).map_err(|e| ConfigError::Decode(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no node could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.max_retries == 0 {
            return Err(invalid("store.max_retries", "must be at least 1"));
        }
        if self.store.timeout_ms == 0 {
            return Err(invalid("store.timeout_ms", "must be greater than 0"));
        }
        if let Some(spread) = self.control.reload_spread {
            if spread <= 0.0 || Duration::try_from_secs_f64(spread).is_err() {
                return Err(invalid("control.reload_spread", "must be a positive number of seconds"));
            }
        }
        for (attr, value) in [
            ("control.channel", &self.control.channel),
            ("control.limits_key", &self.control.limits_key),
            ("control.errors_key", &self.control.errors_key),
            ("control.errors_channel", &self.control.errors_channel),
        ] {
            if value.is_empty() {
                return Err(invalid(attr, "must not be empty"));
            }
        }
        if let Some(remote) = &self.control.remote {
            if remote.authkey.is_empty() {
                return Err(invalid("control.remote.authkey", "must not be empty"));
            }
            if remote.host.is_empty() {
                return Err(invalid("control.remote.host", "must not be empty"));
            }
        }
        Ok(())
    }

    /// A bucket store over `store` using these settings.
    pub fn bucket_store(&self, store: Arc<dyn SharedStore>) -> BucketStore {
        BucketStore::new(store)
            .with_timeout(self.store.timeout())
            .with_max_attempts(self.store.max_retries)
            .with_ttl(self.store.bucket_ttl)
    }
}

fn invalid(attr: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { attr: attr.to_string(), reason: reason.to_string() }
}

/// Shared store access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Per-operation timeout.
    pub timeout_ms: u64,
    /// Compare-and-swap attempts per bucket check.
    pub max_retries: usize,
    /// Attach expiry hints to bucket writes.
    pub bucket_ttl: bool,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { timeout_ms: 1000, max_retries: 5, bucket_ttl: true }
    }
}

/// Control plane keys, channels and mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub channel: String,
    pub errors_channel: String,
    pub errors_key: String,
    pub limits_key: String,
    /// Name this node answers pings with.
    pub node_name: Option<String>,
    /// Key used to pick the pub/sub connection in sharded stores.
    pub shard_hint: Option<String>,
    /// Default spread window, in seconds, for `reload` without an explicit mode.
    pub reload_spread: Option<f64>,
    /// Receive control messages through a bridge instead of subscribing directly.
    pub remote: Option<RemoteConfig>,
}

impl ControlConfig {
    pub fn reload_spread(&self) -> Option<Duration> {
        self.reload_spread
            .filter(|s| *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            channel: "control".to_string(),
            errors_channel: "errors".to_string(),
            errors_key: "errors".to_string(),
            limits_key: "limits".to_string(),
            node_name: None,
            shard_hint: None,
            reload_spread: None,
            remote: None,
        }
    }
}

/// Address and shared secret of a control bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub authkey: String,
}

impl RemoteConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
