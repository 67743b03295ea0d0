//! Error types for the admission engine and its control plane.
use crate::engine::Denial;
use std::fmt;
use std::time::Duration;

/// Transient failures talking to the shared store.
///
/// These are never a rate-limit verdict on their own; the engine applies the configured
/// [`FailurePolicy`](crate::bucket::FailurePolicy) to decide what the client sees.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store did not answer within the connection-level timeout.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    /// Another writer kept winning the compare-and-swap race.
    #[error("bucket {key} still contended after {attempts} attempts")]
    Contention {
        /// Bucket key being updated.
        key: String,
        /// Read-modify-write attempts made.
        attempts: usize,
    },
    /// Connection refused, dropped, or otherwise unusable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Stored bytes could not be decoded.
    #[error("store codec: {0}")]
    Codec(String),
}

/// A limit entry that cannot become part of a snapshot.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Bytes or JSON that do not decode at all.
    #[error("limit entry is not decodable: {0}")]
    Decode(String),
    /// A required attribute is absent.
    #[error("missing required attribute {0:?}")]
    Missing(&'static str),
    /// An attribute or setting has an unusable value.
    #[error("invalid attribute {attr:?}: {reason}")]
    Invalid { attr: String, reason: String },
    /// No class is registered under this id.
    #[error("unknown limit class {0:?}")]
    UnknownClass(String),
    /// A placeholder requirement is not a valid regular expression.
    #[error("bad requirement for {name:?}: {source}")]
    BadRequirement {
        name: String,
        #[source]
        source: regex::Error,
    },
    /// A placeholder is unclosed, badly named or repeated.
    #[error("invalid uri template {template:?}: {reason}")]
    BadTemplate { template: String, reason: String },
}

/// Failures while handling a control message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ControlError {
    /// Empty or otherwise unreadable message text.
    #[error("unparseable control message {0:?}")]
    Parse(String),
    /// No handler knows this command name.
    #[error("no such command {0:?}")]
    UnknownCommand(String),
    /// Names starting with `_` cannot be invoked over the channel.
    #[error("cannot call internal command {0:?}")]
    InternalCommand(String),
    /// A host command ran and reported failure.
    #[error("command {command:?} failed: {reason}")]
    Command { command: String, reason: String },
    /// Publishing a reply or error record failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of the remote control bridge transport.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// Socket-level failure; the client reconnects.
    #[error("bridge io: {0}")]
    Io(#[from] std::io::Error),
    /// The peer refused the shared secret.
    #[error("bridge authentication failed: {0}")]
    Auth(String),
    /// A frame was malformed or arrived out of order.
    #[error("bridge protocol: {0}")]
    Protocol(String),
    /// The peer hung up.
    #[error("bridge connection closed")]
    Closed,
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Protocol(err.to_string())
    }
}

/// Error surfaced by [`AdmissionService`](crate::middleware::AdmissionService).
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// The request exceeded a limit (or the store failed under a fail-closed policy).
    Denied(Denial),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied(denial) => {
                write!(f, "request denied: {} (retry after {}s)", denial.status, denial.retry_after)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Denied(_) => None,
        }
    }
}

impl<E> AdmissionError<E> {
    /// Check if this error is a rate-limit denial
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }

    /// Borrow the denial details if present.
    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Self::Denied(d) => Some(d),
            Self::Inner(_) => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Denied(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    fn denial() -> Denial {
        Denial {
            status: "413 Request Entity Too Large".into(),
            retry_after: 3,
            headers: vec![("Retry-After".into(), "3".into())],
            body: String::new(),
        }
    }

    #[test]
    fn denied_display_mentions_status_and_retry() {
        let err: AdmissionError<io::Error> = AdmissionError::Denied(denial());
        let msg = err.to_string();
        assert!(msg.contains("413"));
        assert!(msg.contains("3s"));
        assert!(err.is_denied());
        assert!(err.source().is_none());
    }

    #[test]
    fn inner_is_exposed_as_source() {
        let err = AdmissionError::Inner(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.source().map(|e| e.to_string()), Some("boom".to_string()));
        assert!(err.denial().is_none());
        assert_eq!(err.into_inner().unwrap().to_string(), "boom");
    }

    #[test]
    fn store_error_messages() {
        let err = StoreError::Contention { key: "bucket:x".into(), attempts: 5 };
        assert_eq!(err.to_string(), "bucket bucket:x still contended after 5 attempts");
        let ctl: ControlError = StoreError::Timeout(Duration::from_secs(1)).into();
        assert!(ctl.to_string().contains("timed out"));
    }
}
