use super::{reaper, IoOptions, SessionCore, Submission};
use crate::config::{PoolPolicy, ReaperPolicy};
use crate::context::{CompletionSink, CorrelationToken, Outcome, RequestContext, Waiter};
use crate::engine::{Command, SubmitError};
use crate::error::{AdapterError, Result};
use crate::pool::PairBuffer;
use crate::types::{
    ContainerId, DeleteOption, IteratorHandle, KvStatus, OpKind, RetrieveOption, StoreOption,
    MAX_KEY_LEN, MIN_KEY_LEN,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A filled context plus the waiter of a synchronous caller.
pub(super) struct Prepared {
    pub(super) ctx: RequestContext,
    pub(super) waiter: Option<Arc<Waiter>>,
}

impl SessionCore {
    pub(crate) fn store(
        &self,
        container: ContainerId,
        key: &[u8],
        value: &[u8],
        option: StoreOption,
        options: IoOptions,
    ) -> Result<Submission> {
        self.check_key(key)?;
        if value.len() > self.config.max_value_size as usize {
            return Err(self.invalid(format!(
                "value of {} bytes exceeds max_value_size {}",
                value.len(),
                self.config.max_value_size
            )));
        }

        let prepared = self.prepare(OpKind::Store, container, None, options, false)?;
        let waiter = prepared.waiter.clone();
        let (token, mut buffer) = self.acquire_with_buffer(prepared)?;
        buffer.set_key(key);
        buffer.stage_value(value);
        self.submit(token, Command::Store { container, option, buffer }, waiter)
    }

    pub(crate) fn retrieve(
        &self,
        container: ContainerId,
        key: &[u8],
        capacity: usize,
        option: RetrieveOption,
        options: IoOptions,
    ) -> Result<Submission> {
        self.check_key(key)?;
        if capacity == 0 || capacity > self.config.max_value_size as usize {
            return Err(self.invalid(format!(
                "retrieve capacity {} outside 1..={}",
                capacity, self.config.max_value_size
            )));
        }

        let prepared = self.prepare(OpKind::Retrieve, container, None, options, false)?;
        let waiter = prepared.waiter.clone();
        let (token, mut buffer) = self.acquire_with_buffer(prepared)?;
        buffer.set_key(key);
        buffer.set_window(capacity);
        self.submit(token, Command::Retrieve { container, option, buffer }, waiter)
    }

    pub(crate) fn delete(
        &self,
        container: ContainerId,
        key: &[u8],
        option: DeleteOption,
        options: IoOptions,
    ) -> Result<Submission> {
        self.check_key(key)?;

        let prepared = self.prepare(OpKind::Delete, container, None, options, false)?;
        let waiter = prepared.waiter.clone();
        let (token, mut buffer) = self.acquire_with_buffer(prepared)?;
        buffer.set_key(key);
        self.submit(token, Command::Delete { container, option, buffer }, waiter)
    }

    pub(crate) fn exist<K: AsRef<[u8]>>(
        &self,
        container: ContainerId,
        keys: &[K],
        result: Vec<u8>,
        options: IoOptions,
    ) -> Result<Submission> {
        if keys.is_empty() {
            return Err(self.invalid("exist needs at least one key"));
        }
        for key in keys {
            self.check_key(key.as_ref())?;
        }
        if result.len() < keys.len() {
            return Err(self.invalid(format!(
                "result buffer of {} bytes cannot hold {} existence codes",
                result.len(),
                keys.len()
            )));
        }

        let prepared = self.prepare(OpKind::Exist, container, None, options, false)?;
        let waiter = prepared.waiter.clone();
        let token = self.acquire_context(prepared)?;
        let keys = keys.iter().map(|k| k.as_ref().to_vec()).collect();
        self.submit(token, Command::Exist { container, keys, result }, waiter)
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() < MIN_KEY_LEN || key.len() > MAX_KEY_LEN {
            return Err(self.invalid(format!(
                "key length {} outside {}..={}",
                key.len(),
                MIN_KEY_LEN,
                MAX_KEY_LEN
            )));
        }
        Ok(())
    }

    /// Choose the completion sink and build the context.
    pub(super) fn prepare(
        &self,
        op: OpKind,
        container: ContainerId,
        iterator: Option<IteratorHandle>,
        options: IoOptions,
        internal: bool,
    ) -> Result<Prepared> {
        self.ensure_open(internal)?;

        let IoOptions {
            private1,
            private2,
            sync,
            callback,
        } = options;

        let (sink, waiter) = match (callback, sync) {
            (Some(f), _) => (CompletionSink::Callback(f), None),
            (None, true) => {
                if reaper::in_reaper() && self.config.reaper_policy == ReaperPolicy::Exclusive {
                    return Err(self.invalid(format!(
                        "synchronous {} from inside a completion callback would wait on its own reaper",
                        op
                    )));
                }
                let waiter = Arc::new(Waiter::new());
                (CompletionSink::Waiter(waiter.clone()), Some(waiter))
            }
            (None, false) => match &self.default_callback {
                Some(f) => (CompletionSink::Callback(f.clone()), None),
                None => (CompletionSink::Discard, None),
            },
        };

        Ok(Prepared {
            ctx: RequestContext {
                op,
                container,
                sink,
                private1,
                private2,
                iterator,
                submitted_at: Instant::now(),
            },
            waiter,
        })
    }

    pub(super) fn acquire_context(&self, prepared: Prepared) -> Result<CorrelationToken> {
        let (token, _) = self.acquire(prepared.ctx, false)?;
        Ok(token)
    }

    fn acquire_with_buffer(&self, prepared: Prepared) -> Result<(CorrelationToken, PairBuffer)> {
        match self.acquire(prepared.ctx, true)? {
            (token, Some(buffer)) => Ok((token, buffer)),
            (token, None) => {
                self.reclaim(token, None);
                Err(AdapterError::PoolExhausted { pool: "buffer" })
            }
        }
    }

    /// Take a context slot, and a buffer when asked, honouring the pool policy.
    ///
    /// Either both are taken or neither.
    fn acquire(
        &self,
        ctx: RequestContext,
        needs_buffer: bool,
    ) -> Result<(CorrelationToken, Option<PairBuffer>)> {
        let deadline = match self.config.pool_policy {
            PoolPolicy::FailFast => None,
            PoolPolicy::Block { timeout_ms } => {
                Some(Instant::now() + Duration::from_millis(timeout_ms))
            }
        };
        let slice = Duration::from_micros(self.config.sync_wait_slice_us.max(1));

        let mut pending = ctx;
        loop {
            let exhausted = {
                let mut book = self.lock_book();
                let buffer = if needs_buffer { book.buffers.acquire() } else { None };
                if needs_buffer && buffer.is_none() {
                    "buffer"
                } else {
                    match book.contexts.acquire(pending) {
                        Ok(token) => return Ok((token, buffer)),
                        Err(returned) => {
                            if let Some(buffer) = buffer {
                                book.buffers.release(buffer);
                            }
                            pending = returned;
                            "context"
                        }
                    }
                }
            };

            let remaining = deadline.and_then(|d| d.checked_duration_since(Instant::now()));
            let Some(remaining) = remaining.filter(|r| !r.is_zero()) else {
                self.metrics.increment_pool_exhausted();
                tracing::debug!("{} pool exhausted for {}", exhausted, pending.op);
                return Err(AdapterError::PoolExhausted { pool: exhausted });
            };

            // drive completions so the wait can make progress
            self.reap(self.config.reap_batch as usize);

            let book = self.lock_book();
            let short = book.contexts.idle() == 0 || (needs_buffer && book.buffers.idle() == 0);
            if short {
                drop(self.wait_released(book, slice.min(remaining)));
            }
        }
    }

    /// Hand a command to the engine and, for synchronous callers, wait for it.
    pub(super) fn submit(
        &self,
        token: CorrelationToken,
        command: Command,
        waiter: Option<Arc<Waiter>>,
    ) -> Result<Submission> {
        let op = command.op();
        match self.engine.submit(token, command) {
            Ok(()) => {
                self.metrics.increment_submitted();
                tracing::debug!("Submitted {} token={}", op, token);
                match waiter {
                    Some(waiter) => Ok(Submission::Completed(self.wait_for(&waiter))),
                    None => Ok(Submission::Submitted(token)),
                }
            }
            Err(rejection) => {
                self.reclaim(token, rejection.command.into_buffer());
                match rejection.error {
                    SubmitError::QueueFull => {
                        self.metrics.increment_queue_full();
                        tracing::debug!("Engine queue full, {} rejected", op);
                        Err(AdapterError::QueueFull)
                    }
                    SubmitError::Rejected(code) => {
                        tracing::warn!("Engine rejected {} with code {}", op, code);
                        Err(AdapterError::Engine {
                            op,
                            status: KvStatus::Device(code),
                        })
                    }
                    SubmitError::Closed => Err(AdapterError::SessionClosed),
                }
            }
        }
    }

    /// Return the context (and buffer) of a submission that never reached the engine.
    fn reclaim(&self, token: CorrelationToken, buffer: Option<PairBuffer>) {
        {
            let mut book = self.lock_book();
            if book.contexts.cancel(token).is_none() {
                tracing::error!("Reclaimed token {} was not in flight", token);
            }
            if let Some(buffer) = buffer {
                book.buffers.release(buffer);
            }
        }
        self.notify_released();
    }

    /// Drive the reaper until `waiter` is signalled.
    fn wait_for(&self, waiter: &Waiter) -> Outcome {
        let slice = Duration::from_micros(self.config.sync_wait_slice_us.max(1));
        loop {
            if let Some(outcome) = waiter.try_take() {
                return outcome;
            }
            self.reap(self.config.reap_batch as usize);
            if let Some(outcome) = waiter.wait(slice) {
                return outcome;
            }
        }
    }
}
