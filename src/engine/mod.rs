//! Engine boundary.
//!
//! The engine is the polled, completion-queue-based substrate underneath the
//! adapter. It accepts commands tagged with a [`CorrelationToken`], returns
//! immediately, and later reports one [`EngineCompletion`] per accepted
//! command through [`KvEngine::poll`].
//!
//! # Contract
//!
//! - `submit` and `poll` never block.
//! - A rejected command is handed back inside the [`Rejection`] together with
//!   any staging buffer it carries; it will never complete.
//! - An accepted command completes exactly once, and each completion is
//!   returned by exactly one `poll` call even when several threads poll.
//! - Commands carrying a [`PairBuffer`] hand it back in
//!   [`CommandOutput::Buffer`].

pub mod memory;
pub mod snapshot;

use crate::context::CorrelationToken;
use crate::error::Result;
use crate::pool::PairBuffer;
use crate::types::{
    ContainerId, DeleteOption, DeviceInfo, IteratorHandle, IteratorList, IteratorOption,
    KvStatus, OpKind, PrefixFilter, RetrieveOption, StoreOption,
};

pub use memory::{MemoryEngine, MemoryEngineConfig};

/// A command submitted to the engine.
#[derive(Debug)]
pub enum Command {
    /// Key and value are staged in the buffer.
    Store {
        container: ContainerId,
        option: StoreOption,
        buffer: PairBuffer,
    },
    /// Key is staged; the engine fills the value area up to its window.
    Retrieve {
        container: ContainerId,
        option: RetrieveOption,
        buffer: PairBuffer,
    },
    Delete {
        container: ContainerId,
        option: DeleteOption,
        buffer: PairBuffer,
    },
    /// One existence code per key is written to `result`.
    Exist {
        container: ContainerId,
        keys: Vec<Vec<u8>>,
        result: Vec<u8>,
    },
    OpenIterator {
        container: ContainerId,
        option: IteratorOption,
        filter: PrefixFilter,
    },
    IteratorNext {
        handle: IteratorHandle,
        list: IteratorList,
    },
    CloseIterator {
        handle: IteratorHandle,
    },
}

impl Command {
    pub fn op(&self) -> OpKind {
        match self {
            Command::Store { .. } => OpKind::Store,
            Command::Retrieve { .. } => OpKind::Retrieve,
            Command::Delete { .. } => OpKind::Delete,
            Command::Exist { .. } => OpKind::Exist,
            Command::OpenIterator { .. } => OpKind::OpenIterator,
            Command::IteratorNext { .. } => OpKind::IteratorNext,
            Command::CloseIterator { .. } => OpKind::CloseIterator,
        }
    }

    /// Recover the staging buffer from a command that was never executed.
    pub fn into_buffer(self) -> Option<PairBuffer> {
        match self {
            Command::Store { buffer, .. }
            | Command::Retrieve { buffer, .. }
            | Command::Delete { buffer, .. } => Some(buffer),
            _ => None,
        }
    }
}

/// Output descriptor carried by a completion.
#[derive(Debug)]
pub enum CommandOutput {
    None,
    Buffer(PairBuffer),
    Exist(Vec<u8>),
    Iterator(IteratorHandle),
    List(IteratorList),
}

/// One completed command.
#[derive(Debug)]
pub struct EngineCompletion {
    pub token: CorrelationToken,
    pub status: KvStatus,
    pub output: CommandOutput,
}

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Submission queue full; retry after reaping.
    QueueFull,
    /// Engine-specific refusal code.
    Rejected(i32),
    /// Engine shut down.
    Closed,
}

/// A refused submission, returning ownership of the command.
#[derive(Debug)]
pub struct Rejection {
    pub command: Command,
    pub error: SubmitError,
}

/// Polled key-value I/O engine.
pub trait KvEngine: Send + Sync {
    /// Queue a command. Never blocks.
    fn submit(&self, token: CorrelationToken, command: Command) -> std::result::Result<(), Rejection>;

    /// Move up to `max` ready completions into `out` (`max == 0` drains all).
    ///
    /// Returns the number appended. Never blocks.
    fn poll(&self, max: usize, out: &mut Vec<EngineCompletion>) -> usize;

    /// Accepted commands whose completions have not been polled yet.
    fn pending(&self) -> usize;

    /// Utilisation in hundredths of a percent (0..=10000).
    fn used_size(&self) -> Result<u32>;

    /// Capacity in bytes.
    fn total_size(&self) -> Result<u64>;

    /// Write amplification factor.
    fn waf(&self) -> f32;

    fn device_info(&self) -> Result<DeviceInfo>;

    /// Release engine resources. Called once no command is pending.
    fn shutdown(&self) -> Result<()>;
}
