//! Device session: pools, engine handle, completion threads and teardown.
//!
//! Every request, synchronous or not, goes through one asynchronous
//! submission primitive. Completions are harvested by
//! [`Session::process_completions`], by background completion threads, or by
//! synchronous callers driving the reaper while they wait.

mod iterator;
mod reaper;
mod submit;

pub(crate) use iterator::{IterPhase, IterState};

use crate::affinity;
use crate::config::Config;
use crate::context::{CompletionFn, ContextTable, CorrelationToken, IoCompletion, Outcome};
use crate::engine::{KvEngine, MemoryEngine, MemoryEngineConfig};
use crate::error::{AdapterError, Result};
use crate::metrics::{Metrics, MetricsReport};
use crate::pool::BufferPool;
use crate::types::{
    ContainerId, DeleteOption, DeviceInfo, IteratorHandle, IteratorList, IteratorOption,
    PrivateCtx, RetrieveOption, StoreOption,
};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Per-call options shared by every submission.
#[derive(Clone, Default)]
pub struct IoOptions {
    pub private1: PrivateCtx,
    pub private2: PrivateCtx,
    /// Block until completion when no callback is given.
    pub sync: bool,
    pub callback: Option<CompletionFn>,
}

impl IoOptions {
    /// Block until the request completes.
    pub fn sync() -> Self {
        Self {
            sync: true,
            ..Self::default()
        }
    }

    /// Return immediately; the session default callback (if any) sees the result.
    pub fn asynchronous() -> Self {
        Self::default()
    }

    /// Return immediately and deliver the result to `f`.
    pub fn with_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&IoCompletion<'_>) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(f));
        self
    }

    pub fn with_private1(mut self, tag: Arc<dyn Any + Send + Sync>) -> Self {
        self.private1 = Some(tag);
        self
    }

    pub fn with_private2(mut self, tag: Arc<dyn Any + Send + Sync>) -> Self {
        self.private2 = Some(tag);
        self
    }
}

/// Result of a submission.
#[derive(Debug)]
pub enum Submission {
    /// Accepted; the completion is delivered later.
    Submitted(CorrelationToken),
    /// Synchronous request that has already completed.
    Completed(Outcome),
}

impl Submission {
    pub fn token(&self) -> Option<CorrelationToken> {
        match self {
            Submission::Submitted(token) => Some(*token),
            Submission::Completed(_) => None,
        }
    }

    pub fn into_outcome(self) -> Option<Outcome> {
        match self {
            Submission::Completed(outcome) => Some(outcome),
            Submission::Submitted(_) => None,
        }
    }
}

/// Occupancy of the session pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub contexts_idle: usize,
    pub contexts_in_flight: usize,
    pub contexts_capacity: usize,
    pub buffers_idle: usize,
    pub buffers_in_flight: usize,
    pub buffers_capacity: usize,
    pub open_iterators: usize,
}

/// State guarded by the bookkeeping lock.
pub(crate) struct Bookkeeping {
    pub contexts: ContextTable,
    pub buffers: BufferPool,
    pub iterators: HashMap<IteratorHandle, IterState>,
}

pub(crate) struct SessionCore {
    pub config: Config,
    pub engine: Arc<dyn KvEngine>,
    book: Mutex<Bookkeeping>,
    // signalled whenever a context or buffer returns to its pool
    released: Condvar,
    reaper_gate: Mutex<()>,
    default_callback: Option<CompletionFn>,
    pub metrics: Metrics,
    closing: AtomicBool,
    closed: AtomicBool,
    stop: AtomicBool,
}

impl SessionCore {
    pub(crate) fn lock_book(&self) -> MutexGuard<'_, Bookkeeping> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_released(&self) {
        self.released.notify_all();
    }

    /// Wait up to `timeout` for a context or buffer to be released.
    pub(crate) fn wait_released<'a>(
        &self,
        book: MutexGuard<'a, Bookkeeping>,
        timeout: Duration,
    ) -> MutexGuard<'a, Bookkeeping> {
        match self.released.wait_timeout(book, timeout) {
            Ok((book, _)) => book,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.lock_book().contexts.in_flight()
    }

    /// Refuse work once the session is closing, unless it is teardown's own.
    pub(crate) fn ensure_open(&self, internal: bool) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AdapterError::SessionClosed);
        }
        if !internal && self.closing.load(Ordering::Acquire) {
            return Err(AdapterError::SessionClosed);
        }
        Ok(())
    }

    pub(crate) fn invalid(&self, msg: impl Into<String>) -> AdapterError {
        self.metrics.increment_invalid_argument();
        AdapterError::invalid(msg)
    }

    fn run_poller(&self, index: usize) {
        if let Some(core) = affinity::core_for_thread(self.config.completion_core_mask, index) {
            affinity::pin_or_warn(1u64 << core, &format!("completion thread {}", index));
        }
        let idle = Duration::from_micros(self.config.poll_interval_us);
        tracing::debug!("Completion thread {} started", index);

        while !self.stop.load(Ordering::Acquire) {
            if self.reap(self.config.reap_batch as usize) == 0 {
                std::thread::sleep(idle);
            }
        }
        tracing::debug!("Completion thread {} stopped", index);
    }
}

/// Builds a [`Session`], optionally with a custom engine or default callback.
pub struct SessionBuilder {
    config: Config,
    engine: Option<Arc<dyn KvEngine>>,
    default_callback: Option<CompletionFn>,
}

impl SessionBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            engine: None,
            default_callback: None,
        }
    }

    /// Use `engine` instead of an in-process [`MemoryEngine`].
    pub fn engine(mut self, engine: Arc<dyn KvEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Handler for asynchronous requests submitted without a callback.
    pub fn default_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&IoCompletion<'_>) + Send + Sync + 'static,
    {
        self.default_callback = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<Session> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| AdapterError::InitFailure(e.to_string()))?;

        let engine = match self.engine {
            Some(engine) => engine,
            None => {
                let engine = MemoryEngine::open(MemoryEngineConfig::from(&config)).map_err(|e| match e {
                    AdapterError::InitFailure(_) => e,
                    other => AdapterError::InitFailure(other.to_string()),
                })?;
                Arc::new(engine)
            }
        };

        if let Ok(info) = engine.device_info() {
            if info.queue_depth < config.queue_depth {
                tracing::warn!(
                    "Engine queue depth {} is below session queue depth {}",
                    info.queue_depth,
                    config.queue_depth
                );
            }
        }

        let book = Bookkeeping {
            contexts: ContextTable::new(config.queue_depth as usize),
            buffers: BufferPool::new(config.buffer_count(), config.max_value_size as usize),
            iterators: HashMap::new(),
        };

        let core = Arc::new(SessionCore {
            config,
            engine,
            book: Mutex::new(book),
            released: Condvar::new(),
            reaper_gate: Mutex::new(()),
            default_callback: self.default_callback,
            metrics: Metrics::new(),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });

        let mut pollers = Vec::new();
        if !core.config.sync_io {
            for index in 0..core.config.completion_threads as usize {
                let worker = core.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("kvudd-cq-{}", index))
                    .spawn(move || worker.run_poller(index));
                match spawned {
                    Ok(handle) => pollers.push(handle),
                    Err(e) => {
                        core.stop.store(true, Ordering::Release);
                        for handle in pollers {
                            let _ = handle.join();
                        }
                        return Err(AdapterError::InitFailure(format!(
                            "failed to start completion thread {}: {}",
                            index, e
                        )));
                    }
                }
            }
        }

        tracing::info!(
            "Session opened on {:?}: depth={}, buffers={}x{}B, completion threads={}, sync_io={}",
            core.config.device_path,
            core.config.queue_depth,
            core.config.buffer_count(),
            core.config.max_value_size,
            pollers.len(),
            core.config.sync_io
        );

        Ok(Session {
            core,
            pollers: Mutex::new(pollers),
        })
    }
}

/// An opened device.
pub struct Session {
    core: Arc<SessionCore>,
    pollers: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Open a session over the in-process engine described by `config`.
    pub fn open(config: Config) -> Result<Self> {
        SessionBuilder::new(config).build()
    }

    /// Open a session over a caller-supplied engine.
    pub fn init(config: Config, engine: Arc<dyn KvEngine>) -> Result<Self> {
        SessionBuilder::new(config).engine(engine).build()
    }

    pub fn builder(config: Config) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Store `value` under `key`.
    pub fn store(
        &self,
        container: ContainerId,
        key: &[u8],
        value: &[u8],
        option: StoreOption,
        options: IoOptions,
    ) -> Result<Submission> {
        self.core.store(container, key, value, option, options)
    }

    /// Read up to `capacity` bytes of the value under `key`.
    pub fn retrieve(
        &self,
        container: ContainerId,
        key: &[u8],
        capacity: usize,
        option: RetrieveOption,
        options: IoOptions,
    ) -> Result<Submission> {
        self.core.retrieve(container, key, capacity, option, options)
    }

    pub fn delete(
        &self,
        container: ContainerId,
        key: &[u8],
        option: DeleteOption,
        options: IoOptions,
    ) -> Result<Submission> {
        self.core.delete(container, key, option, options)
    }

    /// Check presence of every key; one code per key lands in `result`.
    pub fn exist<K: AsRef<[u8]>>(
        &self,
        container: ContainerId,
        keys: &[K],
        result: Vec<u8>,
        options: IoOptions,
    ) -> Result<Submission> {
        self.core.exist(container, keys, result, options)
    }

    pub fn open_iterator(
        &self,
        container: ContainerId,
        option: IteratorOption,
        bitmask: u32,
        bit_pattern: u32,
    ) -> Result<IteratorHandle> {
        self.core.open_iterator(container, option, bitmask, bit_pattern)
    }

    /// Fetch the next batch of entries into `list`.
    pub fn iterator_next(
        &self,
        handle: IteratorHandle,
        list: IteratorList,
        options: IoOptions,
    ) -> Result<Submission> {
        self.core.iterator_next(handle, list, options)
    }

    pub fn close_iterator(&self, handle: IteratorHandle) -> Result<()> {
        self.core.close_iterator(handle, false)
    }

    /// Dispatch up to `max` ready completions (0 drains everything ready).
    ///
    /// Returns the number dispatched; never blocks waiting for completions.
    pub fn process_completions(&self, max: usize) -> usize {
        self.core.reap(max)
    }

    /// Utilisation in hundredths of a percent.
    pub fn used_size(&self) -> Result<u32> {
        self.core.engine.used_size()
    }

    pub fn total_size(&self) -> Result<u64> {
        self.core.engine.total_size()
    }

    pub fn waf(&self) -> f32 {
        self.core.engine.waf()
    }

    pub fn device_info(&self) -> Result<DeviceInfo> {
        self.core.engine.device_info()
    }

    pub fn in_flight(&self) -> usize {
        self.core.in_flight()
    }

    pub fn pool_stats(&self) -> PoolStats {
        let book = self.core.lock_book();
        PoolStats {
            contexts_idle: book.contexts.idle(),
            contexts_in_flight: book.contexts.in_flight(),
            contexts_capacity: book.contexts.capacity(),
            buffers_idle: book.buffers.idle(),
            buffers_in_flight: book.buffers.in_flight(),
            buffers_capacity: book.buffers.capacity(),
            open_iterators: book.iterators.len(),
        }
    }

    pub fn metrics(&self) -> MetricsReport {
        self.core.metrics.report()
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    /// Drain in-flight work, stop completion threads and shut the engine down.
    ///
    /// Fails with `Busy` if work is still in flight after `drain_timeout_ms`;
    /// the session then stays open and usable.
    pub fn close(&self) -> Result<()> {
        let mut pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        let core = &self.core;
        if core.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        core.closing.store(true, Ordering::Release);
        tracing::info!("Closing session on {:?}", core.config.device_path);

        let deadline = Instant::now() + Duration::from_millis(core.config.drain_timeout_ms);
        let idle = Duration::from_micros(core.config.poll_interval_us);
        loop {
            let in_flight = core.in_flight();
            if in_flight == 0 {
                break;
            }
            if Instant::now() >= deadline {
                core.closing.store(false, Ordering::Release);
                tracing::warn!("Close timed out with {} requests in flight", in_flight);
                return Err(AdapterError::Busy { in_flight });
            }
            if core.reap(0) == 0 {
                std::thread::sleep(idle);
            }
        }

        core.stop.store(true, Ordering::Release);
        for handle in pollers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Completion thread panicked");
            }
        }

        let open: Vec<IteratorHandle> = core.lock_book().iterators.keys().copied().collect();
        for handle in open {
            if let Err(e) = core.close_iterator(handle, true) {
                tracing::warn!("Failed to close iterator {} during teardown: {}", handle, e);
            }
        }

        let result = core.engine.shutdown();
        core.closed.store(true, Ordering::Release);
        result?;

        tracing::info!("Session closed");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.close() {
            tracing::warn!("Session dropped without a clean close: {}", e);
        }
        // a failed close leaves completion threads running
        self.core.stop.store(true, Ordering::Release);
        let mut pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in pollers.drain(..) {
            let _ = handle.join();
        }
    }
}
