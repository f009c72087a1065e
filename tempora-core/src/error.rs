//! Error types for Tempora

use crate::Timestamp;
use thiserror::Error;

/// Result type alias for Tempora operations
pub type Result<T> = std::result::Result<T, TemporaError>;

/// Tempora error types
#[derive(Error, Debug)]
pub enum TemporaError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stream key or batch rejected before reaching the WAL
    #[error("Validation error: {0}")]
    Validation(String),

    /// Timestamp does not advance past the last accepted point of its stream
    #[error("Out of order write to {stream}: timestamp {timestamp} <= last {last}")]
    OutOfOrder {
        stream: String,
        timestamp: Timestamp,
        last: Timestamp,
    },

    /// MemTable or flush backlog over budget
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Read aborted through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Flush could not commit an SSTable
    #[error("Flush failed: {0}")]
    FlushFailed(String),

    /// Engine already shut down
    #[error("Storage engine is closed")]
    Closed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TemporaError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TemporaError::Io(_) | TemporaError::Capacity(_) | TemporaError::FlushFailed(_)
        )
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TemporaError::Corruption(_) | TemporaError::ChecksumMismatch { .. }
        )
    }

    /// Check if error is a rejected write that must not be retried as-is
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TemporaError::Validation(_) | TemporaError::OutOfOrder { .. }
        )
    }
}

impl From<bincode::Error> for TemporaError {
    fn from(e: bincode::Error) -> Self {
        TemporaError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for TemporaError {
    fn from(e: serde_json::Error) -> Self {
        TemporaError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let io = TemporaError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert!(io.is_retryable());
        assert!(!io.is_corruption());

        let crc = TemporaError::ChecksumMismatch {
            expected: 1,
            actual: 2,
        };
        assert!(crc.is_corruption());
        assert!(!crc.is_retryable());

        let ooo = TemporaError::OutOfOrder {
            stream: "cpu,host=a".into(),
            timestamp: 5,
            last: 7,
        };
        assert!(ooo.is_validation());
        assert_eq!(
            ooo.to_string(),
            "Out of order write to cpu,host=a: timestamp 5 <= last 7"
        );
    }
}
