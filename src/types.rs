//! Shared value types: operation kinds, completion status codes, command
//! options, the iterator prefix filter and the iterator result list.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Logical key-space partition within a session.
pub type ContainerId = u32;

/// Opaque caller tag round-tripped into the completion, never inspected.
pub type PrivateCtx = Option<Arc<dyn Any + Send + Sync>>;

/// Minimum key length accepted by the adapter.
pub const MIN_KEY_LEN: usize = 4;

/// Maximum key length accepted by the adapter.
pub const MAX_KEY_LEN: usize = 255;

/// Largest value the device command set can carry (2MB).
pub const MAX_VALUE_LEN: usize = 2 * 1024 * 1024;

/// Smallest iterator list buffer worth submitting.
pub const MIN_ITERATOR_BUFFER: usize = 16;

/// Largest iterator list buffer (2MB).
pub const MAX_ITERATOR_BUFFER: usize = 2 * 1024 * 1024;

/// Existence code written for a key that is present.
pub const EXIST_PRESENT: u8 = 1;

/// Existence code written for a key that is absent.
pub const EXIST_ABSENT: u8 = 0;

/// Kind of request carried by a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Store,
    Retrieve,
    Delete,
    Exist,
    OpenIterator,
    IteratorNext,
    CloseIterator,
}

impl OpKind {
    /// Stable name used for logging and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Store => "store",
            OpKind::Retrieve => "retrieve",
            OpKind::Delete => "delete",
            OpKind::Exist => "exist",
            OpKind::OpenIterator => "open_iterator",
            OpKind::IteratorNext => "iterator_next",
            OpKind::CloseIterator => "close_iterator",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result code reported by the engine on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvStatus {
    Success,
    KeyNotFound,
    KeyExists,
    /// Retrieve buffer or iterator list too small for the data.
    BufferTooSmall,
    ValueTooLarge,
    /// No further keys match the iterator filter.
    IteratorEnd,
    IteratorNotFound,
    TooManyIterators,
    DeviceFull,
    /// Device-specific failure code.
    Device(i32),
}

impl KvStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, KvStatus::Success)
    }

    /// Numeric code, stable across releases.
    pub fn code(&self) -> i32 {
        match self {
            KvStatus::Success => 0,
            KvStatus::KeyNotFound => 1,
            KvStatus::KeyExists => 2,
            KvStatus::BufferTooSmall => 3,
            KvStatus::ValueTooLarge => 4,
            KvStatus::IteratorEnd => 5,
            KvStatus::IteratorNotFound => 6,
            KvStatus::TooManyIterators => 7,
            KvStatus::DeviceFull => 8,
            KvStatus::Device(code) => *code,
        }
    }
}

impl fmt::Display for KvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvStatus::Success => f.write_str("success"),
            KvStatus::KeyNotFound => f.write_str("key not found"),
            KvStatus::KeyExists => f.write_str("key exists"),
            KvStatus::BufferTooSmall => f.write_str("buffer too small"),
            KvStatus::ValueTooLarge => f.write_str("value too large"),
            KvStatus::IteratorEnd => f.write_str("iterator end"),
            KvStatus::IteratorNotFound => f.write_str("iterator not found"),
            KvStatus::TooManyIterators => f.write_str("too many iterators"),
            KvStatus::DeviceFull => f.write_str("device full"),
            KvStatus::Device(code) => write!(f, "device error {}", code),
        }
    }
}

/// Store behaviour when the key already exists (or does not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreOption {
    /// Insert or replace.
    #[default]
    Overwrite,
    /// Replace only; `KeyNotFound` if absent.
    UpdateOnly,
    /// Insert only; `KeyExists` if present.
    NoOverwrite,
    /// Append to the existing value, inserting if absent.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetrieveOption {
    #[default]
    Default,
    /// Remove the key after a successful read.
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteOption {
    /// Succeeds whether or not the key exists.
    #[default]
    Default,
    /// `KeyNotFound` if the key is absent.
    ErrorIfMissing,
}

/// What an iterator returns per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IteratorOption {
    #[default]
    KeyOnly,
    KeyValue,
}

/// Bit-mask/bit-pattern filter over the first four key bytes.
///
/// A key matches when `(prefix & bitmask) == (bit_pattern & bitmask)`, where
/// `prefix` is the big-endian value of the first four key bytes, zero padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrefixFilter {
    pub bitmask: u32,
    pub bit_pattern: u32,
}

impl PrefixFilter {
    pub fn new(bitmask: u32, bit_pattern: u32) -> Self {
        Self { bitmask, bit_pattern }
    }

    /// Filter matching every key.
    pub fn all() -> Self {
        Self::new(0, 0)
    }

    pub fn key_prefix(key: &[u8]) -> u32 {
        let mut prefix = [0u8; 4];
        let n = key.len().min(4);
        prefix[..n].copy_from_slice(&key[..n]);
        u32::from_be_bytes(prefix)
    }

    pub fn matches(&self, key: &[u8]) -> bool {
        (Self::key_prefix(key) & self.bitmask) == (self.bit_pattern & self.bitmask)
    }
}

/// Session-scoped cursor handle issued by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IteratorHandle(pub u32);

impl fmt::Display for IteratorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One key (and optionally its value) produced by an iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IteratorEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl IteratorEntry {
    /// Bytes this entry occupies in a list buffer.
    pub fn encoded_len(key: &[u8], value: Option<&[u8]>) -> usize {
        match value {
            Some(value) => 8 + key.len() + value.len(),
            None => 4 + key.len(),
        }
    }
}

/// Caller-provided buffer filled by one `iterator_next` call.
///
/// The byte capacity bounds how many entries a single batch may carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IteratorList {
    entries: Vec<IteratorEntry>,
    capacity: usize,
    used: usize,
    end: bool,
}

impl IteratorList {
    /// Create an empty list holding at most `capacity` bytes of entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            used: 0,
            end: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    pub fn entries(&self) -> &[IteratorEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<IteratorEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once the engine has reported that no further keys match.
    pub fn is_end(&self) -> bool {
        self.end
    }

    pub fn mark_end(&mut self) {
        self.end = true;
    }

    /// Append an entry if it fits; returns false when the list is full.
    pub fn try_push(&mut self, key: &[u8], value: Option<&[u8]>) -> bool {
        let cost = IteratorEntry::encoded_len(key, value);
        if cost > self.remaining() {
            return false;
        }
        self.entries.push(IteratorEntry {
            key: key.to_vec(),
            value: value.map(|v| v.to_vec()),
        });
        self.used += cost;
        true
    }

    /// Empty the list for reuse, keeping its capacity.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.used = 0;
        self.end = false;
    }
}

/// Device description reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub capacity: u64,
    pub max_key_len: u32,
    pub max_value_len: u32,
    pub optimal_value_len: u32,
    pub queue_depth: u32,
    pub max_iterators: u32,
    pub persistent: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_filter_matching() {
        let filter = PrefixFilter::new(0xFF00_0000, 0x6100_0000); // first byte 'a'
        assert!(filter.matches(b"apple"));
        assert!(filter.matches(b"azzz"));
        assert!(!filter.matches(b"banana"));

        assert!(PrefixFilter::all().matches(b"anything"));
    }

    #[test]
    fn test_prefix_pads_short_keys() {
        assert_eq!(PrefixFilter::key_prefix(b"ab"), 0x6162_0000);
        assert_eq!(PrefixFilter::key_prefix(b"abcdef"), 0x6162_6364);
    }

    #[test]
    fn test_iterator_list_capacity() {
        let mut list = IteratorList::with_capacity(20);
        assert!(list.try_push(b"key1", None)); // 8 bytes
        assert!(list.try_push(b"key2", None)); // 16 bytes
        assert!(!list.try_push(b"key3", None)); // would be 24
        assert_eq!(list.len(), 2);
        assert_eq!(list.remaining(), 4);

        list.mark_end();
        assert!(list.is_end());
        list.clear();
        assert!(list.is_empty());
        assert!(!list.is_end());
        assert_eq!(list.remaining(), 20);
    }

    #[test]
    fn test_iterator_list_values_cost_more() {
        let mut list = IteratorList::with_capacity(32);
        assert!(list.try_push(b"key1", Some(b"0123456789")));
        assert_eq!(list.remaining(), 32 - 22);
        assert_eq!(list.entries()[0].value.as_deref(), Some(&b"0123456789"[..]));
    }

    #[test]
    fn test_status_codes_distinct() {
        let all = [
            KvStatus::Success,
            KvStatus::KeyNotFound,
            KvStatus::KeyExists,
            KvStatus::BufferTooSmall,
            KvStatus::ValueTooLarge,
            KvStatus::IteratorEnd,
            KvStatus::IteratorNotFound,
            KvStatus::TooManyIterators,
            KvStatus::DeviceFull,
        ];
        let mut codes: Vec<i32> = all.iter().map(|s| s.code()).collect();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert!(KvStatus::Success.is_success());
        assert!(!KvStatus::Device(-5).is_success());
    }
}
