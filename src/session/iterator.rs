use super::{IoOptions, SessionCore, Submission};
use crate::engine::Command;
use crate::error::{AdapterError, Result};
use crate::types::{
    ContainerId, IteratorHandle, IteratorList, IteratorOption, KvStatus, OpKind, PrefixFilter,
    MAX_ITERATOR_BUFFER, MIN_ITERATOR_BUFFER,
};

/// Adapter-side phase of an open iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IterPhase {
    Idle,
    /// One `iterator_next` in flight.
    Fetching,
    /// End of scan observed; further fetches report `IteratorEnd`.
    Exhausted,
    Closing,
}

#[derive(Debug)]
pub(crate) struct IterState {
    pub phase: IterPhase,
    pub container: ContainerId,
}

impl IterState {
    pub(crate) fn new(container: ContainerId) -> Self {
        Self {
            phase: IterPhase::Idle,
            container,
        }
    }
}

impl SessionCore {
    pub(crate) fn open_iterator(
        &self,
        container: ContainerId,
        option: IteratorOption,
        bitmask: u32,
        bit_pattern: u32,
    ) -> Result<IteratorHandle> {
        let op = OpKind::OpenIterator;
        let prepared = self.prepare(op, container, None, IoOptions::sync(), false)?;
        if self.lock_book().iterators.len() >= self.config.max_iterators as usize {
            return Err(AdapterError::Engine {
                op,
                status: KvStatus::TooManyIterators,
            });
        }

        let waiter = prepared.waiter.clone();
        let token = self.acquire_context(prepared)?;
        let filter = PrefixFilter::new(bitmask, bit_pattern);
        let outcome = self
            .submit(token, Command::OpenIterator { container, option, filter }, waiter)?
            .into_outcome()
            .ok_or(AdapterError::Engine {
                op,
                status: KvStatus::Device(-1),
            })?;

        if !outcome.is_success() {
            return Err(AdapterError::Engine {
                op,
                status: outcome.status,
            });
        }
        let handle = outcome.iterator.ok_or(AdapterError::Engine {
            op,
            status: KvStatus::Device(-1),
        })?;

        tracing::debug!("Opened iterator {} on container {}", handle, container);
        Ok(handle)
    }

    pub(crate) fn iterator_next(
        &self,
        handle: IteratorHandle,
        list: IteratorList,
        options: IoOptions,
    ) -> Result<Submission> {
        if list.capacity() < MIN_ITERATOR_BUFFER || list.capacity() > MAX_ITERATOR_BUFFER {
            return Err(self.invalid(format!(
                "iterator list capacity {} outside {}..={}",
                list.capacity(),
                MIN_ITERATOR_BUFFER,
                MAX_ITERATOR_BUFFER
            )));
        }

        let container = self.iterator_container(handle)?;
        let prepared = self.prepare(OpKind::IteratorNext, container, Some(handle), options, false)?;

        let previous = self.begin_phase(handle, IterPhase::Fetching)?;
        let waiter = prepared.waiter.clone();
        let mut list = list;
        list.clear();

        let result = self
            .acquire_context(prepared)
            .and_then(|token| self.submit(token, Command::IteratorNext { handle, list }, waiter));
        if result.is_err() {
            self.restore_phase(handle, IterPhase::Fetching, previous);
        }
        result
    }

    /// Close `handle`. Teardown passes `internal` to bypass the closing gate.
    pub(crate) fn close_iterator(&self, handle: IteratorHandle, internal: bool) -> Result<()> {
        let op = OpKind::CloseIterator;
        let container = self.iterator_container(handle)?;
        let prepared = self.prepare(op, container, Some(handle), IoOptions::sync(), internal)?;

        let previous = self.begin_phase(handle, IterPhase::Closing)?;
        let waiter = prepared.waiter.clone();

        let submitted = self
            .acquire_context(prepared)
            .and_then(|token| self.submit(token, Command::CloseIterator { handle }, waiter));
        let submission = match submitted {
            Ok(submission) => submission,
            Err(e) => {
                self.restore_phase(handle, IterPhase::Closing, previous);
                return Err(e);
            }
        };

        let status = submission
            .into_outcome()
            .map(|outcome| outcome.status)
            .unwrap_or(KvStatus::Device(-1));
        if !status.is_success() {
            return Err(AdapterError::Engine { op, status });
        }

        tracing::debug!("Closed iterator {}", handle);
        Ok(())
    }

    fn iterator_container(&self, handle: IteratorHandle) -> Result<ContainerId> {
        let container = self.lock_book().iterators.get(&handle).map(|s| s.container);
        container.ok_or_else(|| self.invalid(format!("unknown iterator {}", handle)))
    }

    /// Move an iterator into `next`, refusing if a fetch or close is in flight.
    fn begin_phase(&self, handle: IteratorHandle, next: IterPhase) -> Result<IterPhase> {
        let mut book = self.lock_book();
        let Some(state) = book.iterators.get_mut(&handle) else {
            drop(book);
            return Err(self.invalid(format!("unknown iterator {}", handle)));
        };
        match state.phase {
            IterPhase::Fetching | IterPhase::Closing => Err(AdapterError::IteratorBusy(handle)),
            previous => {
                state.phase = next;
                Ok(previous)
            }
        }
    }

    /// Undo `begin_phase` after a submission that never reached the engine.
    fn restore_phase(&self, handle: IteratorHandle, current: IterPhase, previous: IterPhase) {
        let mut book = self.lock_book();
        if let Some(state) = book.iterators.get_mut(&handle) {
            if state.phase == current {
                state.phase = previous;
            }
        }
    }
}
