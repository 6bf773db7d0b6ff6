//! Request contexts and the slot arena that owns them.
//!
//! A context lives in a slot of the [`ContextTable`]. Its
//! [`CorrelationToken`] is the slot index plus a generation counter, so a
//! token that outlives its request can never resolve to the slot's next
//! occupant. Slots move `Idle -> InFlight -> Completing -> Idle`; only the
//! reaper that wins `take` may dispatch a completion, and the slot is not
//! reusable until that dispatch has finished and called `release`.

use crate::types::{ContainerId, IteratorHandle, IteratorList, KvStatus, OpKind, PrivateCtx};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Identifier linking a submitted command to its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationToken(u64);

impl CorrelationToken {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    pub fn index(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    pub fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw value handed to the engine.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index(), self.generation())
    }
}

/// Completion callback. Invoked once per accepted asynchronous request.
pub type CompletionFn = Arc<dyn Fn(&IoCompletion<'_>) + Send + Sync>;

/// What a callback observes when its request completes.
///
/// Borrowed slices point into the request's staging buffer and output
/// buffers, which return to the pool once the callback returns.
pub struct IoCompletion<'a> {
    pub token: CorrelationToken,
    pub op: OpKind,
    pub container: ContainerId,
    pub status: KvStatus,
    pub key: &'a [u8],
    /// Retrieved bytes (possibly truncated, see `value_len`).
    pub value: &'a [u8],
    /// Full length of the value on the device.
    pub value_len: usize,
    /// Existence codes, one per requested key.
    pub exist: &'a [u8],
    pub list: Option<&'a IteratorList>,
    pub iterator: Option<IteratorHandle>,
    pub private1: &'a PrivateCtx,
    pub private2: &'a PrivateCtx,
}

/// Owned result of a completed request.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub op: OpKind,
    pub status: KvStatus,
    pub value: Option<Vec<u8>>,
    pub value_len: usize,
    pub exist: Option<Vec<u8>>,
    pub list: Option<IteratorList>,
    pub iterator: Option<IteratorHandle>,
    pub private1: PrivateCtx,
    pub private2: PrivateCtx,
}

impl Outcome {
    /// Copy everything a completion exposes.
    pub fn from_completion(completion: &IoCompletion<'_>) -> Self {
        let value = match completion.op {
            OpKind::Retrieve => Some(completion.value.to_vec()),
            _ => None,
        };
        let exist = match completion.op {
            OpKind::Exist => Some(completion.exist.to_vec()),
            _ => None,
        };

        Self {
            op: completion.op,
            status: completion.status,
            value,
            value_len: completion.value_len,
            exist,
            list: completion.list.cloned(),
            iterator: completion.iterator,
            private1: completion.private1.clone(),
            private2: completion.private2.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Rendezvous for a synchronous caller.
pub(crate) struct Waiter {
    slot: Mutex<Option<Outcome>>,
    cond: Condvar,
}

impl Waiter {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn complete(&self, outcome: Outcome) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(outcome);
        self.cond.notify_all();
    }

    pub(crate) fn try_take(&self) -> Option<Outcome> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Wait up to `timeout` for the outcome.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<Outcome> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut slot, _) = self
            .cond
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.take()
    }
}

/// Where a completion is delivered.
pub(crate) enum CompletionSink {
    Callback(CompletionFn),
    Waiter(Arc<Waiter>),
    Discard,
}

/// State of one outstanding request.
pub(crate) struct RequestContext {
    pub op: OpKind,
    pub container: ContainerId,
    pub sink: CompletionSink,
    pub private1: PrivateCtx,
    pub private2: PrivateCtx,
    pub iterator: Option<IteratorHandle>,
    pub submitted_at: Instant,
}

enum SlotState {
    Idle,
    InFlight(RequestContext),
    Completing,
}

struct Slot {
    generation: u32,
    state: SlotState,
}

/// Arena of context slots with an idle free list.
pub(crate) struct ContextTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ContextTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                state: SlotState::Idle,
            })
            .collect();
        let free = (0..capacity as u32).rev().collect();

        Self { slots, free }
    }

    /// Move a context into an idle slot, or hand it back if none is free.
    pub(crate) fn acquire(
        &mut self,
        ctx: RequestContext,
    ) -> std::result::Result<CorrelationToken, RequestContext> {
        let Some(index) = self.free.pop() else {
            return Err(ctx);
        };
        let slot = &mut self.slots[index as usize];
        slot.state = SlotState::InFlight(ctx);
        Ok(CorrelationToken::new(index, slot.generation))
    }

    /// Claim an in-flight context for dispatch. Succeeds once per submission.
    pub(crate) fn take(&mut self, token: CorrelationToken) -> Option<RequestContext> {
        let slot = self.slot_mut(token)?;
        match std::mem::replace(&mut slot.state, SlotState::Completing) {
            SlotState::InFlight(ctx) => Some(ctx),
            other => {
                slot.state = other;
                None
            }
        }
    }

    /// Return a dispatched slot to the free list.
    pub(crate) fn release(&mut self, token: CorrelationToken) -> bool {
        let Some(slot) = self.slot_mut(token) else {
            return false;
        };
        if !matches!(slot.state, SlotState::Completing) {
            return false;
        }
        slot.state = SlotState::Idle;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(token.index());
        true
    }

    /// Reclaim a context whose submission the engine refused.
    pub(crate) fn cancel(&mut self, token: CorrelationToken) -> Option<RequestContext> {
        let slot = self.slot_mut(token)?;
        match std::mem::replace(&mut slot.state, SlotState::Idle) {
            SlotState::InFlight(ctx) => {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(token.index());
                Some(ctx)
            }
            other => {
                slot.state = other;
                None
            }
        }
    }

    pub(crate) fn idle(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot_mut(&mut self, token: CorrelationToken) -> Option<&mut Slot> {
        let slot = self.slots.get_mut(token.index() as usize)?;
        (slot.generation == token.generation()).then_some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(op: OpKind) -> RequestContext {
        RequestContext {
            op,
            container: 0,
            sink: CompletionSink::Discard,
            private1: None,
            private2: None,
            iterator: None,
            submitted_at: Instant::now(),
        }
    }

    #[test]
    fn test_token_packing() {
        let token = CorrelationToken::new(7, 3);
        assert_eq!(token.index(), 7);
        assert_eq!(token.generation(), 3);
        assert_eq!(CorrelationToken::from_u64(token.as_u64()), token);
    }

    #[test]
    fn test_acquire_until_exhausted() {
        let mut table = ContextTable::new(2);
        let a = table.acquire(ctx(OpKind::Store)).ok().unwrap();
        let b = table.acquire(ctx(OpKind::Retrieve)).ok().unwrap();
        assert_ne!(a.index(), b.index());
        assert_eq!(table.in_flight(), 2);

        let rejected = table.acquire(ctx(OpKind::Delete));
        assert!(matches!(rejected, Err(ref c) if c.op == OpKind::Delete));
        assert_eq!(table.idle() + table.in_flight(), table.capacity());
    }

    #[test]
    fn test_take_is_exactly_once() {
        let mut table = ContextTable::new(1);
        let token = table.acquire(ctx(OpKind::Store)).ok().unwrap();

        assert!(table.take(token).is_some());
        assert!(table.take(token).is_none());
        // slot stays out of the free list until released
        assert_eq!(table.idle(), 0);

        assert!(table.release(token));
        assert!(!table.release(token));
        assert_eq!(table.idle(), 1);
    }

    #[test]
    fn test_stale_token_does_not_match_next_occupant() {
        let mut table = ContextTable::new(1);
        let first = table.acquire(ctx(OpKind::Store)).ok().unwrap();
        table.take(first).unwrap();
        table.release(first);

        let second = table.acquire(ctx(OpKind::Retrieve)).ok().unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(table.take(first).is_none());
        assert_eq!(table.take(second).map(|c| c.op), Some(OpKind::Retrieve));
    }

    #[test]
    fn test_cancel_returns_slot() {
        let mut table = ContextTable::new(1);
        let token = table.acquire(ctx(OpKind::Exist)).ok().unwrap();
        assert_eq!(table.cancel(token).map(|c| c.op), Some(OpKind::Exist));
        assert_eq!(table.idle(), 1);
        assert!(table.cancel(token).is_none());
        assert!(table.take(token).is_none());
    }

    #[test]
    fn test_waiter_handoff() {
        let waiter = Arc::new(Waiter::new());
        assert!(waiter.try_take().is_none());
        assert!(waiter.wait(Duration::from_millis(1)).is_none());

        let remote = waiter.clone();
        let handle = std::thread::spawn(move || {
            remote.complete(Outcome {
                op: OpKind::Delete,
                status: KvStatus::Success,
                value: None,
                value_len: 0,
                exist: None,
                list: None,
                iterator: None,
                private1: None,
                private2: None,
            });
        });
        let outcome = waiter.wait(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(outcome.op, OpKind::Delete);
        assert!(outcome.is_success());
    }
}
