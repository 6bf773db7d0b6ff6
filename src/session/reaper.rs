use super::{IterPhase, IterState, SessionCore};
use crate::config::ReaperPolicy;
use crate::context::{CompletionSink, IoCompletion, Outcome};
use crate::engine::{CommandOutput, EngineCompletion};
use crate::types::{KvStatus, OpKind};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::TryLockError;

thread_local! {
    static REAPING: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread is dispatching completions.
pub(super) fn in_reaper() -> bool {
    REAPING.with(|r| r.get())
}

struct ReapingGuard {
    prev: bool,
}

impl ReapingGuard {
    fn enter() -> Self {
        Self {
            prev: REAPING.with(|r| r.replace(true)),
        }
    }
}

impl Drop for ReapingGuard {
    fn drop(&mut self) {
        REAPING.with(|r| r.set(self.prev));
    }
}

impl SessionCore {
    /// Dispatch up to `max` ready completions (`0` = all ready).
    pub(crate) fn reap(&self, max: usize) -> usize {
        match self.config.reaper_policy {
            ReaperPolicy::Exclusive => {
                let _gate = match self.reaper_gate.try_lock() {
                    Ok(gate) => gate,
                    Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                    Err(TryLockError::WouldBlock) => return 0,
                };
                self.reap_batch(max)
            }
            ReaperPolicy::Shared => self.reap_batch(max),
        }
    }

    fn reap_batch(&self, max: usize) -> usize {
        let mut ready = Vec::new();
        if self.engine.poll(max, &mut ready) == 0 {
            return 0;
        }

        let _reaping = ReapingGuard::enter();
        ready
            .into_iter()
            .map(|completion| self.dispatch(completion))
            .filter(|dispatched| *dispatched)
            .count()
    }

    /// Deliver one completion to its sink and recycle its context.
    fn dispatch(&self, completion: EngineCompletion) -> bool {
        let EngineCompletion { token, status, output } = completion;

        let ctx = {
            let mut book = self.lock_book();
            let Some(ctx) = book.contexts.take(token) else {
                if let CommandOutput::Buffer(buffer) = output {
                    book.buffers.release(buffer);
                }
                drop(book);
                self.notify_released();
                self.metrics.increment_duplicate_completions();
                tracing::warn!("Dropping completion for token {} that is not in flight", token);
                return false;
            };

            match (ctx.op, &output) {
                (OpKind::OpenIterator, CommandOutput::Iterator(handle)) if status.is_success() => {
                    book.iterators.insert(*handle, IterState::new(ctx.container));
                }
                (OpKind::IteratorNext, _) => {
                    let exhausted = status == KvStatus::IteratorEnd
                        || matches!(&output, CommandOutput::List(list) if list.is_end());
                    if let Some(state) = ctx.iterator.and_then(|h| book.iterators.get_mut(&h)) {
                        if state.phase == IterPhase::Fetching {
                            state.phase = if exhausted { IterPhase::Exhausted } else { IterPhase::Idle };
                        }
                    }
                }
                (OpKind::CloseIterator, _) => {
                    if let Some(handle) = ctx.iterator {
                        book.iterators.remove(&handle);
                    }
                }
                _ => {}
            }
            ctx
        };

        let waiting = {
            let empty: &[u8] = &[];
            let (key, value, value_len) = match &output {
                CommandOutput::Buffer(buffer) => (buffer.key(), buffer.value(), buffer.actual_len()),
                _ => (empty, empty, 0),
            };
            let completion = IoCompletion {
                token,
                op: ctx.op,
                container: ctx.container,
                status,
                key,
                value,
                value_len,
                exist: match &output {
                    CommandOutput::Exist(codes) => codes.as_slice(),
                    _ => empty,
                },
                list: match &output {
                    CommandOutput::List(list) => Some(list),
                    _ => None,
                },
                iterator: match &output {
                    CommandOutput::Iterator(handle) => Some(*handle),
                    _ => ctx.iterator,
                },
                private1: &ctx.private1,
                private2: &ctx.private2,
            };

            self.metrics.record_latency(ctx.op, ctx.submitted_at.elapsed());
            self.metrics.increment_completed();
            tracing::debug!("Completed {} token={} status={}", ctx.op, token, status);

            match &ctx.sink {
                CompletionSink::Callback(callback) => {
                    self.metrics.increment_callbacks();
                    if catch_unwind(AssertUnwindSafe(|| callback(&completion))).is_err() {
                        self.metrics.increment_callback_panics();
                        tracing::warn!("Completion callback for {} token={} panicked", ctx.op, token);
                    }
                    None
                }
                CompletionSink::Waiter(waiter) => {
                    Some((waiter.clone(), Outcome::from_completion(&completion)))
                }
                CompletionSink::Discard => None,
            }
        };

        {
            let mut book = self.lock_book();
            book.contexts.release(token);
            if let CommandOutput::Buffer(buffer) = output {
                if !book.buffers.release(buffer) {
                    tracing::error!("Engine returned a buffer that does not belong to this session");
                }
            }
        }
        self.notify_released();

        // a woken synchronous caller may reuse the slot straight away
        if let Some((waiter, outcome)) = waiting {
            waiter.complete(outcome);
        }
        true
    }
}
