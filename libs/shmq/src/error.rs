//! Channel Error Types
//!
//! Error handling for channel attach, the data path, the journal and the
//! command channel.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Journal operation that failed, each reported separately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    Open,
    Map,
    Truncate,
    Lock,
    Sync,
}

impl fmt::Display for JournalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            JournalOp::Open => "open",
            JournalOp::Map => "mmap",
            JournalOp::Truncate => "ftruncate",
            JournalOp::Lock => "lock",
            JournalOp::Sync => "msync",
        };
        f.write_str(op)
    }
}

/// Main channel error type
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Bad index, empty name or unusable capacity
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Endpoint table full, segment pool empty or channel full
    #[error("Resource exhausted: {resource}: {message}")]
    ResourceExhausted { resource: String, message: String },

    /// Channel, pool or journal absent
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Lost a creation race; callers usually treat this as success
    #[error("Already exists: {name}")]
    AlreadyExists { name: String },

    /// Journal IO failures
    #[error("Journal {op} failed for {path:?}: {source}")]
    Journal {
        op: JournalOp,
        path: PathBuf,
        source: std::io::Error,
    },

    /// Payload larger than the jumbo ceiling
    #[error("Payload of {size} bytes exceeds the {limit} byte ceiling")]
    OversizedPayload { size: usize, limit: usize },

    /// Wait with no signal
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Shared memory content that fails validation
    #[error("Corrupted shared state: {message}")]
    Corrupted { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;

impl ChannelError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::AlreadyExists { name: name.into() }
    }

    /// Create a journal error for the given operation
    pub fn journal(op: JournalOp, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Journal {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn oversized(size: usize, limit: usize) -> Self {
        Self::OversizedPayload { size, limit }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Check if retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::ResourceExhausted { .. } => true,
            ChannelError::Timeout { .. } => true,
            ChannelError::Io { .. } => true,
            ChannelError::Journal { op, .. } => *op == JournalOp::Lock,
            ChannelError::InvalidArgument { .. } => false,
            ChannelError::NotFound { .. } => false,
            ChannelError::AlreadyExists { .. } => false,
            ChannelError::OversizedPayload { .. } => false,
            ChannelError::Corrupted { .. } => false,
            ChannelError::Configuration { .. } => false,
        }
    }

    /// Check if this is a lost creation race
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ChannelError::AlreadyExists { .. })
    }

    /// Get error category for logs
    pub fn category(&self) -> &'static str {
        match self {
            ChannelError::InvalidArgument { .. } => "invalid_argument",
            ChannelError::ResourceExhausted { .. } => "resource_exhausted",
            ChannelError::NotFound { .. } => "not_found",
            ChannelError::AlreadyExists { .. } => "already_exists",
            ChannelError::Journal { .. } => "journal",
            ChannelError::OversizedPayload { .. } => "oversized_payload",
            ChannelError::Timeout { .. } => "timeout",
            ChannelError::Corrupted { .. } => "corrupted",
            ChannelError::Configuration { .. } => "configuration",
            ChannelError::Io { .. } => "io",
        }
    }
}

/// Convert standard I/O errors to channel errors
impl From<std::io::Error> for ChannelError {
    fn from(error: std::io::Error) -> Self {
        ChannelError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

/// Configuration loading errors surface as configuration failures
impl From<anyhow::Error> for ChannelError {
    fn from(error: anyhow::Error) -> Self {
        ChannelError::configuration(format!("{:#}", error), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let err = ChannelError::resource_exhausted("channel", "no free slots");
        assert_eq!(err.category(), "resource_exhausted");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_journal_ops_are_distinguishable() {
        let err = ChannelError::journal(
            JournalOp::Truncate,
            "/tmp/a.journal",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        match &err {
            ChannelError::Journal { op, .. } => assert_eq!(*op, JournalOp::Truncate),
            _ => panic!("Expected Journal error"),
        }
        assert!(err.to_string().contains("ftruncate"));
        assert_eq!(err.category(), "journal");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ChannelError::timeout("wait", 1000).is_retryable());
        assert!(!ChannelError::invalid_argument("index 3").is_retryable());
        assert!(!ChannelError::oversized(2, 1).is_retryable());
        assert!(ChannelError::already_exists("P_Q").is_already_exists());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "test");
        let err = ChannelError::from(io_err);

        match err {
            ChannelError::Io { message, .. } => {
                assert!(message.contains("test"));
            }
            _ => panic!("Expected Io error"),
        }
    }
}
