//! Error types for kvudd.
//!
//! Errors returned synchronously by the adapter. Device-reported failures of
//! accepted commands are not errors: they arrive as a [`KvStatus`] on the
//! completion.

use crate::types::{IteratorHandle, KvStatus, OpKind};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kvudd operations.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Error types for adapter operations.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Malformed request, rejected before the pool or the engine is touched.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No idle context or staging buffer was available.
    ///
    /// Transient; callers may back off and retry.
    #[error("{pool} pool exhausted")]
    PoolExhausted {
        /// Which pool ran dry ("context" or "buffer")
        pool: &'static str,
    },

    /// The engine's submission queue is full.
    ///
    /// The request was not accepted and will never complete.
    #[error("Engine submission queue is full")]
    QueueFull,

    /// The engine reported a failure for an operation.
    #[error("{op} failed with status {status}")]
    Engine {
        /// Operation that failed
        op: OpKind,
        /// Status reported by the engine
        status: KvStatus,
    },

    /// The session could not be opened.
    #[error("Initialization failed: {0}")]
    InitFailure(String),

    /// Teardown could not drain outstanding work before its deadline.
    #[error("Session busy: {in_flight} requests still in flight")]
    Busy {
        /// Contexts still owned by in-flight commands
        in_flight: usize,
    },

    /// An iterator already has a fetch in flight or is being closed.
    #[error("Iterator {0} is busy")]
    IteratorBusy(IteratorHandle),

    /// The session is closing or closed.
    #[error("Session is closed")]
    SessionClosed,

    /// Configuration validation failed.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Snapshot data failed structural validation.
    #[error("Corrupted snapshot {path:?} at offset {offset}")]
    CorruptedSnapshot {
        /// Path to the snapshot file
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
    },

    /// Checksum verification failed.
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Expected checksum value
        expected: u32,
        /// Actual checksum value computed from data
        actual: u32,
    },

    /// I/O error from the operating system.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON parsing or serialization failed.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl AdapterError {
    /// Returns true for transient resource pressure the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::PoolExhausted { .. } | AdapterError::QueueFull | AdapterError::IteratorBusy(_)
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        AdapterError::InvalidArgument(msg.into())
    }
}
