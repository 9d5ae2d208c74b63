/*!
Error types for the cfgvault core engine.

Store errors and capture errors are kept apart: a store error means the device
side already produced a valid capture, so it is never a reason to log in again.
*/

use cfgvault_retry::RetryableError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type used by the artifact store.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the artifact store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The artifact directory already exists
    #[error("Artifact directory already exists (immutability violation): {path}")]
    ImmutabilityViolation { path: String },

    /// Nothing stored at the requested path
    #[error("Artifact not found: {path}")]
    NotFound { path: String },

    /// Integrity check failures
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// Path escapes the store root or is otherwise unusable
    #[error("Invalid artifact path: {0}")]
    InvalidPath(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl StoreError {
    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid path error
    pub fn invalid_path<S: Into<String>>(msg: S) -> Self {
        Self::InvalidPath(msg.into())
    }

    pub fn not_found<S: Into<String>>(path: S) -> Self {
        Self::NotFound { path: path.into() }
    }
}

/// Why a management session could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectFailure {
    Authentication,
    Timeout,
    Unreachable,
    Protocol,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectFailure::Authentication => "authentication failed",
            ConnectFailure::Timeout => "connection timed out",
            ConnectFailure::Unreachable => "device unreachable",
            ConnectFailure::Protocol => "session negotiation failed",
        };
        f.write_str(label)
    }
}

/// Error category reported at the boundary. Retry eligibility is a function of
/// this value only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Connect,
    Capture,
    Precondition,
    Store,
    RelayTimeout,
    Unsupported,
    Busy,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Connect | ErrorCategory::Capture | ErrorCategory::RelayTimeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Connect => "connect",
            ErrorCategory::Capture => "capture",
            ErrorCategory::Precondition => "precondition",
            ErrorCategory::Store => "store",
            ErrorCategory::RelayTimeout => "relay_timeout",
            ErrorCategory::Unsupported => "unsupported",
            ErrorCategory::Busy => "busy",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while capturing a configuration from a device.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("{kind} for {target}: {message}")]
    Connect {
        kind: ConnectFailure,
        target: String,
        message: String,
    },

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Relay file not received within {} seconds", waited.as_secs())]
    RelayTimeout { waited: Duration },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl CaptureError {
    pub fn connect<T: Into<String>, M: Into<String>>(
        kind: ConnectFailure,
        target: T,
        message: M,
    ) -> Self {
        Self::Connect {
            kind,
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn capture<S: Into<String>>(msg: S) -> Self {
        Self::Capture(msg.into())
    }

    pub fn precondition<S: Into<String>>(msg: S) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CaptureError::Connect { .. } => ErrorCategory::Connect,
            CaptureError::Capture(_) => ErrorCategory::Capture,
            CaptureError::Precondition(_) => ErrorCategory::Precondition,
            CaptureError::RelayTimeout { .. } => ErrorCategory::RelayTimeout,
            CaptureError::Store(_) => ErrorCategory::Store,
            CaptureError::Unsupported(_) => ErrorCategory::Unsupported,
        }
    }

    /// True when the failure was a deadline rather than a refusal.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CaptureError::RelayTimeout { .. }
                | CaptureError::Connect {
                    kind: ConnectFailure::Timeout,
                    ..
                }
        )
    }
}

impl RetryableError for CaptureError {
    fn is_transient(&self) -> bool {
        self.category().is_retryable()
    }
}

/// Boundary error value: category plus a short human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    pub category: ErrorCategory,
    pub message: String,
}

impl AttemptError {
    pub fn new<S: Into<String>>(category: ErrorCategory, message: S) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl From<&CaptureError> for AttemptError {
    fn from(err: &CaptureError) -> Self {
        Self::new(err.category(), err.to_string())
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

impl ConfigError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
}
