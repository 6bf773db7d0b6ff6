//! # kvudd - Key-Value Device Adapter
//!
//! kvudd sits between a key-value storage front end and a key-value device
//! driven through a polled completion queue. It turns typed requests into
//! device commands, tracks each in-flight command by a correlation token and
//! dispatches completions back to the caller.
//!
//! ## Architecture
//!
//! - **Object Pool**: Fixed set of DMA-style staging buffers sized once at init
//! - **Request Context**: Generation-tagged slots correlating completions to requests
//! - **Submission Path**: Validated store/retrieve/delete/exist/iterator commands
//! - **Completion Reaper**: Bounded polling that recycles contexts and buffers
//! - **Session Lifecycle**: Engine bring-up, completion threads and draining teardown
//!
//! ## Example Usage
//!
//! ```no_run
//! use kvudd::{Config, IoOptions, RetrieveOption, Session, StoreOption};
//! use std::path::PathBuf;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Create configuration
//!     let config = Config::new(PathBuf::from("./data/device.snap"));
//!
//!     // Open the device session
//!     let session = Session::open(config)?;
//!
//!     // Synchronous STORE
//!     session.store(0, b"key1", b"value1", StoreOption::Overwrite, IoOptions::sync())?;
//!
//!     // Synchronous RETRIEVE
//!     let outcome = session
//!         .retrieve(0, b"key1", 4096, RetrieveOption::Default, IoOptions::sync())?
//!         .into_outcome();
//!     assert_eq!(outcome.and_then(|o| o.value), Some(b"value1".to_vec()));
//!
//!     // Asynchronous STORE, harvested by polling
//!     session.store(0, b"key2", b"value2", StoreOption::Overwrite, IoOptions::asynchronous())?;
//!     session.process_completions(0);
//!
//!     // Drain and close
//!     session.close()?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Device session, submission path and completion reaper
//! - [`engine`]: Engine interface and the in-process memory engine
//! - [`pool`]: Staging buffer pool
//! - [`context`]: Request contexts and correlation tokens
//! - [`async_session`]: Futures on top of completion callbacks
//! - [`metrics`]: Latency and counter collection
//! - [`config`]: Configuration structures
//! - [`error`]: Error types and result aliases

/// CPU affinity for submission and completion threads
pub mod affinity;

/// Async wrapper over callback completions
pub mod async_session;

/// Checksum utilities (CRC32, XXH64) for snapshot integrity
pub mod checksum;

/// Command-line interface
pub mod cli;

/// Configuration structures and validation
pub mod config;

/// Request contexts, correlation tokens and completion records
pub mod context;

/// Engine interface and memory engine
pub mod engine;

/// Error types
pub mod error;

/// Performance metrics collection
pub mod metrics;

/// Staging buffer pool
pub mod pool;

/// Device session lifecycle and request paths
pub mod session;

/// Shared value types and limits
pub mod types;

// Re-export commonly used types
pub use async_session::AsyncSession;
pub use config::{Config, PoolPolicy, ReaperPolicy};
pub use context::{CompletionFn, CorrelationToken, IoCompletion, Outcome};
pub use engine::{KvEngine, MemoryEngine, MemoryEngineConfig};
pub use error::{AdapterError, Result};
pub use session::{IoOptions, PoolStats, Session, SessionBuilder, Submission};
pub use types::{
    ContainerId, DeleteOption, DeviceInfo, IteratorEntry, IteratorHandle, IteratorList,
    IteratorOption, KvStatus, OpKind, PrefixFilter, RetrieveOption, StoreOption,
};
