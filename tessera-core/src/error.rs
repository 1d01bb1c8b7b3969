//! Error types for tessera

use thiserror::Error;

/// Result type alias for tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Tessera error types
#[derive(Error, Debug)]
pub enum Error {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown stream or table
    #[error("not found: {0}")]
    NotFound(String),

    /// Expression failed validation
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// Iteration aborted mid-stream; partial results already delivered
    /// may be consumed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Transient WAL read failure; follower loops log and retry
    #[error("WAL read error: {0}")]
    WalRead(String),

    /// The WAL was closed underneath a blocked reader
    #[error("WAL closed")]
    WalClosed,

    /// A follower callback failed, terminating the follow
    #[error("follower callback failed: {0}")]
    FollowerCallback(String),

    /// No handler was available for a partition during query fan-out
    #[error("partition unavailable: {0}")]
    PartitionUnavailable(String),

    /// Checksum mismatch while reading framed records
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Check if the error is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::WalRead(_))
    }

    /// Check if the error signals an exceeded iteration deadline
    pub fn is_deadline(&self) -> bool {
        matches!(self, Error::DeadlineExceeded)
    }
}
