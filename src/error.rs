//! Error types for treesync

use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for treesync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote returned status {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Check if error is transient. Sends are never retried; this only
    /// feeds log payloads.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Http(e) => e.is_timeout() || e.is_connect(),
            SyncError::Remote { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Taxonomy label used in journal payloads
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Config(_) => "configuration",
            SyncError::InvalidPath(_) | SyncError::Io(_) | SyncError::Watcher(_) => "io",
            SyncError::Http(_) | SyncError::Remote { .. } => "network",
            SyncError::Serialization(_) => "protocol",
            SyncError::ChannelClosed(_) | SyncError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(SyncError::Config("x".into()).kind(), "configuration");
        assert_eq!(SyncError::InvalidPath("../a".into()).kind(), "io");
        assert_eq!(
            SyncError::Remote {
                status: 502,
                body: String::new()
            }
            .kind(),
            "network"
        );
    }

    #[test]
    fn test_remote_retryable() {
        let server_error = SyncError::Remote {
            status: 503,
            body: "unavailable".into(),
        };
        let client_error = SyncError::Remote {
            status: 400,
            body: "bad".into(),
        };
        assert!(server_error.is_retryable());
        assert!(!client_error.is_retryable());
        assert!(!SyncError::Config("missing".into()).is_retryable());
    }
}
