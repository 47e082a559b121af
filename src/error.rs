//! Error types for the status engine
//!
//! Errors are classified by how far they travel:
//! - Source errors: recovered locally, reported per source in the refresh report
//! - Store errors: surfaced to the caller of `refresh()` as a persistence failure
//! - Config and delivery errors: reported to whoever loaded the config or
//!   owns the notification collaborator

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::types::Timestamp;

/// Failure of a single signal source query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Query timed out after {} ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Failed to decode response: {0}")]
    Decoding(String),

    #[error("Not authorized by the scoring service")]
    Unauthorized,

    #[error("Scoring service returned {status}: {body}")]
    Server { status: u16, body: String },
}

/// Coarse error family, used for logging and report serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceErrorKind {
    Network,
    Timeout,
    Decoding,
}

impl SourceError {
    pub fn kind(&self) -> SourceErrorKind {
        match self {
            SourceError::Network(_) | SourceError::Unauthorized | SourceError::Server { .. } => {
                SourceErrorKind::Network
            }
            SourceError::Timeout(_) => SourceErrorKind::Timeout,
            SourceError::Decoding(_) => SourceErrorKind::Decoding,
        }
    }

    /// Returns true if a later cycle can reasonably succeed without user action
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Network(_) | SourceError::Timeout(_) => true,
            SourceError::Server { status, .. } => *status >= 500 || *status == 429,
            SourceError::Decoding(_) | SourceError::Unauthorized => false,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            SourceError::Decoding(err.to_string())
        } else {
            SourceError::Network(err.to_string())
        }
    }
}

/// Durable storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize status: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Corrupt stored value in {field}: {value}")]
    Corrupt { field: &'static str, value: String },

    #[error("Store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Config file not found at {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failures of the notification-delivery collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("Notification permission denied")]
    PermissionDenied,

    #[error("Failed to deliver notification: {0}")]
    Failed(String),
}

/// A refresh cycle failed as a whole. Cloned to every coalesced caller.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    /// State was computed and observers notified, but the durable write
    /// failed. The next successful cycle rewrites the full state.
    #[error("Failed to persist status at {at}: {message}")]
    PersistenceWrite {
        message: String,
        at: Timestamp,
        report: Box<crate::orchestrator::RefreshReport>,
    },

    #[error("Refresh cancelled: status engine shut down")]
    Cancelled,

    /// The cycle task panicked before publishing a result.
    #[error("Refresh cycle aborted before finishing")]
    Aborted,
}

impl RefreshError {
    /// The report of the cycle, when one completed.
    pub fn report(&self) -> Option<&crate::orchestrator::RefreshReport> {
        match self {
            RefreshError::PersistenceWrite { report, .. } => Some(report),
            RefreshError::Cancelled | RefreshError::Aborted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(SourceError::Unauthorized.kind(), SourceErrorKind::Network);
        assert_eq!(
            SourceError::Timeout(Duration::from_secs(5)).kind(),
            SourceErrorKind::Timeout
        );
        assert_eq!(
            SourceError::Decoding("bad json".into()).kind(),
            SourceErrorKind::Decoding
        );
    }

    #[test]
    fn test_retryable_server_statuses() {
        let unavailable = SourceError::Server {
            status: 503,
            body: String::new(),
        };
        let bad_request = SourceError::Server {
            status: 400,
            body: String::new(),
        };
        assert!(unavailable.is_retryable());
        assert!(!bad_request.is_retryable());
        assert!(!SourceError::Unauthorized.is_retryable());
    }

    #[test]
    fn test_timeout_message_in_millis() {
        let err = SourceError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Query timed out after 1500 ms");
    }
}
