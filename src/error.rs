//! Error types for fdrlog

use std::io;
use thiserror::Error;

/// Result type for fdrlog operations
pub type Result<T> = std::result::Result<T, FdrError>;

/// Errors that can occur in fdrlog
#[derive(Debug, Error)]
pub enum FdrError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid log file format (bad magic, version, malformed payload)
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Not enough bytes left to decode a value
    #[error("Truncated data: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes remaining
        available: usize,
    },

    /// Declared size exceeds an allocation limit
    #[error("Data too large: {size} bytes exceeds limit of {limit} bytes")]
    TooBig {
        /// Declared size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// Encryption setup or processing failure
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Compression or decompression failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Log file already opened
    #[error("Log already opened")]
    AlreadyOpen,

    /// Log file not opened
    #[error("Log not opened")]
    NotOpen,

    /// In-place header field rewrite rejected
    #[error("Cannot rewrite field '{field}': encoded size {actual} does not match reserved {expected}")]
    FieldRewrite {
        /// Field name
        field: String,
        /// Reserved encoded size
        expected: usize,
        /// Encoded size of the new value
        actual: usize,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}
