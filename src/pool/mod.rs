//! Pre-allocated key/value staging buffers.
//!
//! Every buffer is allocated once when the session opens and then cycles
//! between the pool and whichever in-flight command holds it. A buffer is a
//! move-only value, so once released it cannot be touched by the releaser.

use crate::types::MAX_KEY_LEN;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A fixed-capacity key area plus value area staged for the engine.
#[derive(Debug)]
pub struct PairBuffer {
    pool_id: u64,
    slot: u32,
    key: Vec<u8>,
    value: Vec<u8>,
    value_len: usize,
    actual_len: usize,
    window: usize,
}

impl PairBuffer {
    fn new(pool_id: u64, slot: u32, value_capacity: usize) -> Self {
        Self {
            pool_id,
            slot,
            key: Vec::with_capacity(MAX_KEY_LEN),
            value: vec![0u8; value_capacity],
            value_len: 0,
            actual_len: 0,
            window: value_capacity,
        }
    }

    /// Slot index inside the owning pool.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Valid value bytes: the staged payload, or what the engine filled in.
    pub fn value(&self) -> &[u8] {
        &self.value[..self.value_len]
    }

    /// Bytes the value area can hold.
    pub fn value_capacity(&self) -> usize {
        self.value.len()
    }

    /// Bytes the engine may write for a retrieve.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Full length of the value as known to the engine.
    ///
    /// Exceeds `value().len()` when a retrieve was truncated.
    pub fn actual_len(&self) -> usize {
        self.actual_len
    }

    /// Copy a retrieved value in, truncating to the window.
    ///
    /// Returns false when the value did not fit.
    pub fn fill_value(&mut self, data: &[u8]) -> bool {
        let n = data.len().min(self.window);
        self.value[..n].copy_from_slice(&data[..n]);
        self.value_len = n;
        self.actual_len = data.len();
        n == data.len()
    }

    pub(crate) fn set_key(&mut self, key: &[u8]) {
        debug_assert!(key.len() <= MAX_KEY_LEN);
        self.key.clear();
        self.key.extend_from_slice(key);
    }

    pub(crate) fn stage_value(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.value.len());
        self.value[..data.len()].copy_from_slice(data);
        self.value_len = data.len();
        self.actual_len = data.len();
    }

    pub(crate) fn set_window(&mut self, window: usize) {
        self.window = window.min(self.value.len());
    }

    fn reset(&mut self) {
        self.key.clear();
        self.value_len = 0;
        self.actual_len = 0;
        self.window = self.value.len();
    }
}

/// Fixed set of staging buffers.
///
/// Not internally synchronized; the session serializes access under its
/// bookkeeping lock.
#[derive(Debug)]
pub struct BufferPool {
    id: u64,
    idle: Vec<PairBuffer>,
    capacity: usize,
    value_capacity: usize,
}

impl BufferPool {
    /// Pre-allocate `count` buffers with `value_capacity` bytes of value space each.
    pub fn new(count: usize, value_capacity: usize) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let idle = (0..count)
            .rev()
            .map(|slot| PairBuffer::new(id, slot as u32, value_capacity))
            .collect();

        Self {
            id,
            idle,
            capacity: count,
            value_capacity,
        }
    }

    pub fn acquire(&mut self) -> Option<PairBuffer> {
        self.idle.pop()
    }

    /// Return a buffer. Refuses buffers that belong to another pool.
    pub fn release(&mut self, mut buffer: PairBuffer) -> bool {
        if buffer.pool_id != self.id || self.idle.len() >= self.capacity {
            return false;
        }
        buffer.reset();
        self.idle.push(buffer);
        true
    }

    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.idle.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn value_capacity(&self) -> usize {
        self.value_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation() {
        let pool = BufferPool::new(4, 1024);
        assert_eq!(pool.idle(), 4);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.value_capacity(), 1024);
    }

    #[test]
    fn test_acquire_release_keeps_invariant() {
        let mut pool = BufferPool::new(2, 64);

        let a = pool.acquire().unwrap();
        assert_eq!(pool.idle() + pool.in_flight(), pool.capacity());
        let b = pool.acquire().unwrap();
        assert_ne!(a.slot(), b.slot());
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_flight(), 2);

        assert!(pool.release(a));
        assert_eq!(pool.idle(), 1);
        assert!(pool.acquire().is_some());
        assert!(pool.release(b));
        assert_eq!(pool.idle() + pool.in_flight(), pool.capacity());
    }

    #[test]
    fn test_release_refuses_foreign_buffer() {
        let mut first = BufferPool::new(1, 64);
        let mut second = BufferPool::new(1, 64);

        let foreign = second.acquire().unwrap();
        assert!(!first.release(foreign));
        assert_eq!(first.idle(), 1);
        assert_eq!(second.in_flight(), 1);
    }

    #[test]
    fn test_released_buffer_is_reset() {
        let mut pool = BufferPool::new(1, 64);
        let mut buf = pool.acquire().unwrap();
        buf.set_key(b"key1");
        buf.stage_value(b"payload");
        assert_eq!(buf.value(), b"payload");
        assert!(pool.release(buf));

        let buf = pool.acquire().unwrap();
        assert!(buf.key().is_empty());
        assert!(buf.value().is_empty());
        assert_eq!(buf.window(), 64);
    }

    #[test]
    fn test_fill_value_truncates_to_window() {
        let mut pool = BufferPool::new(1, 64);
        let mut buf = pool.acquire().unwrap();
        buf.set_window(4);

        assert!(!buf.fill_value(b"abcdefgh"));
        assert_eq!(buf.value(), b"abcd");
        assert_eq!(buf.actual_len(), 8);

        buf.set_window(100);
        assert_eq!(buf.window(), 64);
        assert!(buf.fill_value(b"abcdefgh"));
        assert_eq!(buf.value(), b"abcdefgh");
    }
}
