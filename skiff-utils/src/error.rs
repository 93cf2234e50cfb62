//! Error types for skiff
//!
//! Provides a unified error type used across all skiff crates.

use std::path::PathBuf;

/// Main error type for skiff operations
#[derive(Debug, thiserror::Error)]
pub enum SkiffError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Connection Errors ===

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// The connection was not open and the operation could not be queued,
    /// or teardown cancelled it while it was pending.
    #[error("Disconnected")]
    Disconnected,

    #[error("No response within {seconds}s")]
    Timeout { seconds: u64 },

    // === Protocol Errors ===

    /// Revision mismatch on a write; the caller must re-synchronize
    /// before retrying.
    #[error("Revision conflict on {path}")]
    Conflict { path: String },

    #[error("Server error: {0}")]
    Remote(String),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    // === Session Errors ===

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No focused session")]
    NoFocusedSession,

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SkiffError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a remote (server-reported) error
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Create a malformed-frame error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable as-is
    ///
    /// Conflicts are deliberately not retryable: the caller must
    /// re-synchronize first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Disconnected | Self::Timeout { .. }
        )
    }
}

/// Result type alias using SkiffError
pub type Result<T> = std::result::Result<T, SkiffError>;
