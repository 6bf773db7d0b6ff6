//! In-process engine backed by a concurrent skip list.
//!
//! Commands either execute on the submitting thread (inline mode) or are
//! queued to a dedicated submission worker, pinned to the submission core
//! mask. Either way their completions land on a ready queue that `poll`
//! drains, so callers only ever observe results through completions.

use super::snapshot::{read_snapshot, SnapshotWriter};
use super::{Command, CommandOutput, EngineCompletion, KvEngine, Rejection, SubmitError};
use crate::affinity;
use crate::checksum::ChecksumAlgorithm;
use crate::config::Config;
use crate::context::CorrelationToken;
use crate::error::{AdapterError, Result};
use crate::types::{
    ContainerId, DeleteOption, DeviceInfo, IteratorHandle, IteratorList, IteratorOption,
    KvStatus, PrefixFilter, RetrieveOption, StoreOption, EXIST_ABSENT, EXIST_PRESENT,
    MAX_KEY_LEN, MAX_VALUE_LEN,
};
use crate::pool::PairBuffer;
use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::VecDeque;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

/// Value size the in-process engine reports as optimal.
const OPTIMAL_VALUE_LEN: u32 = 4096;

/// Settings of the in-process engine.
#[derive(Debug, Clone)]
pub struct MemoryEngineConfig {
    /// Accepted-but-unpolled commands allowed before `QueueFull`.
    pub queue_depth: usize,
    pub capacity_bytes: u64,
    pub persistent: bool,
    /// Snapshot file used when `persistent` is set.
    pub path: PathBuf,
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Execute commands on a dedicated submission thread.
    pub worker: bool,
    pub submission_core_mask: u64,
    /// Shuffle ready completions with this seed before each poll.
    pub reorder_seed: Option<u64>,
    pub max_iterators: u32,
    pub max_value_len: usize,
}

impl MemoryEngineConfig {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth,
            capacity_bytes: 1024 * 1024 * 1024,
            persistent: false,
            path: PathBuf::new(),
            checksum_algorithm: ChecksumAlgorithm::CRC32,
            worker: false,
            submission_core_mask: 0,
            reorder_seed: None,
            max_iterators: 16,
            max_value_len: MAX_VALUE_LEN,
        }
    }

    pub fn with_capacity_bytes(mut self, capacity: u64) -> Self {
        self.capacity_bytes = capacity;
        self
    }

    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.persistent = true;
        self.path = path;
        self
    }

    pub fn with_worker(mut self, worker: bool) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_reorder_seed(mut self, seed: u64) -> Self {
        self.reorder_seed = Some(seed);
        self
    }

    pub fn with_max_iterators(mut self, max: u32) -> Self {
        self.max_iterators = max;
        self
    }
}

impl From<&Config> for MemoryEngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            queue_depth: config.queue_depth as usize,
            capacity_bytes: config.capacity_bytes,
            persistent: config.persistent,
            path: config.device_path.clone(),
            checksum_algorithm: config.checksum_algorithm,
            // a dedicated submission core gets a dedicated submission worker
            worker: config.submission_core_mask != 0,
            submission_core_mask: config.submission_core_mask,
            reorder_seed: None,
            max_iterators: config.max_iterators,
            max_value_len: config.max_value_size as usize,
        }
    }
}

struct Cursor {
    container: ContainerId,
    option: IteratorOption,
    filter: PrefixFilter,
    last_key: Option<Vec<u8>>,
    done: bool,
}

/// Key-value state plus the counters behind the passthrough statistics.
struct Store {
    data: SkipMap<(ContainerId, Vec<u8>), Vec<u8>>,
    // serializes read-modify-write commands
    write_lock: Mutex<()>,
    iterators: DashMap<u32, Cursor>,
    next_iterator: AtomicU32,
    used_bytes: AtomicU64,
    host_bytes_written: AtomicU64,
    media_bytes_written: AtomicU64,
    capacity: u64,
    max_iterators: u32,
    max_value_len: usize,
}

impl Store {
    fn new(config: &MemoryEngineConfig) -> Self {
        Self {
            data: SkipMap::new(),
            write_lock: Mutex::new(()),
            iterators: DashMap::new(),
            next_iterator: AtomicU32::new(1),
            used_bytes: AtomicU64::new(0),
            host_bytes_written: AtomicU64::new(0),
            media_bytes_written: AtomicU64::new(0),
            capacity: config.capacity_bytes,
            max_iterators: config.max_iterators,
            max_value_len: config.max_value_len,
        }
    }

    fn execute(&self, command: Command) -> (KvStatus, CommandOutput) {
        match command {
            Command::Store { container, option, buffer } => {
                let status = self.store(container, option, &buffer);
                (status, CommandOutput::Buffer(buffer))
            }
            Command::Retrieve { container, option, mut buffer } => {
                let status = self.retrieve(container, option, &mut buffer);
                (status, CommandOutput::Buffer(buffer))
            }
            Command::Delete { container, option, buffer } => {
                let status = self.delete(container, option, buffer.key());
                (status, CommandOutput::Buffer(buffer))
            }
            Command::Exist { container, keys, mut result } => {
                for (code, key) in result.iter_mut().zip(&keys) {
                    let present = self.data.contains_key(&(container, key.clone()));
                    *code = if present { EXIST_PRESENT } else { EXIST_ABSENT };
                }
                (KvStatus::Success, CommandOutput::Exist(result))
            }
            Command::OpenIterator { container, option, filter } => {
                self.open_iterator(container, option, filter)
            }
            Command::IteratorNext { handle, mut list } => {
                let status = self.iterator_next(handle, &mut list);
                (status, CommandOutput::List(list))
            }
            Command::CloseIterator { handle } => match self.iterators.remove(&handle.0) {
                Some(_) => (KvStatus::Success, CommandOutput::None),
                None => (KvStatus::IteratorNotFound, CommandOutput::None),
            },
        }
    }

    fn store(&self, container: ContainerId, option: StoreOption, buffer: &PairBuffer) -> KvStatus {
        let key = (container, buffer.key().to_vec());
        let payload = buffer.value();
        if payload.len() > self.max_value_len {
            return KvStatus::ValueTooLarge;
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = self.data.get(&key).map(|e| e.value().clone());

        let value = match (option, existing.as_ref()) {
            (StoreOption::UpdateOnly, None) => return KvStatus::KeyNotFound,
            (StoreOption::NoOverwrite, Some(_)) => return KvStatus::KeyExists,
            (StoreOption::Append, Some(old)) => {
                if old.len() + payload.len() > self.max_value_len {
                    return KvStatus::ValueTooLarge;
                }
                let mut value = Vec::with_capacity(old.len() + payload.len());
                value.extend_from_slice(old);
                value.extend_from_slice(payload);
                value
            }
            _ => payload.to_vec(),
        };

        let old_size = existing.map(|v| (key.1.len() + v.len()) as u64).unwrap_or(0);
        let new_size = (key.1.len() + value.len()) as u64;
        let used = self.used_bytes.load(Ordering::Relaxed);
        if used - old_size + new_size > self.capacity {
            return KvStatus::DeviceFull;
        }

        self.host_bytes_written
            .fetch_add((key.1.len() + payload.len()) as u64, Ordering::Relaxed);
        self.media_bytes_written.fetch_add(new_size, Ordering::Relaxed);
        self.used_bytes
            .store(used - old_size + new_size, Ordering::Relaxed);
        self.data.insert(key, value);
        KvStatus::Success
    }

    fn retrieve(&self, container: ContainerId, option: RetrieveOption, buffer: &mut PairBuffer) -> KvStatus {
        let key = (container, buffer.key().to_vec());
        // read and remove under one writer lock so no store lands in between
        let _guard = (option == RetrieveOption::Delete)
            .then(|| self.write_lock.lock().unwrap_or_else(PoisonError::into_inner));
        let fits = match self.data.get(&key) {
            Some(entry) => buffer.fill_value(entry.value()),
            None => return KvStatus::KeyNotFound,
        };
        if !fits {
            return KvStatus::BufferTooSmall;
        }

        if option == RetrieveOption::Delete {
            self.remove(&key);
        }
        KvStatus::Success
    }

    fn delete(&self, container: ContainerId, option: DeleteOption, key: &[u8]) -> KvStatus {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = self.remove(&(container, key.to_vec()));
        if !removed && option == DeleteOption::ErrorIfMissing {
            return KvStatus::KeyNotFound;
        }
        KvStatus::Success
    }

    // caller holds write_lock
    fn remove(&self, key: &(ContainerId, Vec<u8>)) -> bool {
        match self.data.remove(key) {
            Some(entry) => {
                let size = (key.1.len() + entry.value().len()) as u64;
                self.used_bytes.fetch_sub(size, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn open_iterator(
        &self,
        container: ContainerId,
        option: IteratorOption,
        filter: PrefixFilter,
    ) -> (KvStatus, CommandOutput) {
        if self.iterators.len() >= self.max_iterators as usize {
            return (KvStatus::TooManyIterators, CommandOutput::None);
        }
        let id = self.next_iterator.fetch_add(1, Ordering::Relaxed);
        self.iterators.insert(
            id,
            Cursor {
                container,
                option,
                filter,
                last_key: None,
                done: false,
            },
        );
        (KvStatus::Success, CommandOutput::Iterator(IteratorHandle(id)))
    }

    fn iterator_next(&self, handle: IteratorHandle, list: &mut IteratorList) -> KvStatus {
        let Some(mut cursor) = self.iterators.get_mut(&handle.0) else {
            return KvStatus::IteratorNotFound;
        };
        if cursor.done {
            list.mark_end();
            return KvStatus::IteratorEnd;
        }

        let container = cursor.container;
        let resume = cursor.last_key.clone();
        let start = match &resume {
            Some(last) => Bound::Excluded((container, last.clone())),
            None => Bound::Included((container, Vec::new())),
        };

        let mut last_pushed = resume;
        let mut exhausted = true;
        for entry in self.data.range((start, Bound::Unbounded)) {
            let (entry_container, key) = entry.key();
            if *entry_container != container {
                break;
            }
            if !cursor.filter.matches(key) {
                continue;
            }
            let value = match cursor.option {
                IteratorOption::KeyValue => Some(entry.value().as_slice()),
                IteratorOption::KeyOnly => None,
            };
            if !list.try_push(key, value) {
                exhausted = false;
                break;
            }
            last_pushed = Some(key.clone());
        }
        cursor.last_key = last_pushed;

        if !exhausted && list.is_empty() {
            return KvStatus::BufferTooSmall;
        }
        if exhausted {
            list.mark_end();
            cursor.done = true;
            if list.is_empty() {
                return KvStatus::IteratorEnd;
            }
        }
        KvStatus::Success
    }
}

struct Shared {
    store: Store,
    ready: Mutex<VecDeque<EngineCompletion>>,
    outstanding: AtomicUsize,
    queue_depth: usize,
    closed: AtomicBool,
    reorder: Option<Mutex<StdRng>>,
    submissions: Mutex<VecDeque<(CorrelationToken, Command)>>,
    submitted: Condvar,
}

impl Shared {
    fn complete(&self, token: CorrelationToken, command: Command) {
        let (status, output) = self.store.execute(command);
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        ready.push_back(EngineCompletion { token, status, output });
    }

    fn run_worker(&self) {
        loop {
            let batch: Vec<_> = {
                let mut queue = self.submissions.lock().unwrap_or_else(PoisonError::into_inner);
                while queue.is_empty() && !self.closed.load(Ordering::Acquire) {
                    queue = self
                        .submitted
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                if queue.is_empty() {
                    return;
                }
                queue.drain(..).collect()
            };
            for (token, command) in batch {
                self.complete(token, command);
            }
        }
    }
}

/// Engine keeping all data in memory, optionally snapshotted to disk.
pub struct MemoryEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: MemoryEngineConfig,
    shut_down: AtomicBool,
}

impl MemoryEngine {
    /// Open the engine, restoring the snapshot of a persistent device.
    pub fn open(config: MemoryEngineConfig) -> Result<Self> {
        let store = Store::new(&config);
        if config.persistent {
            load_snapshot(&config, &store)?;
        }

        let shared = Arc::new(Shared {
            store,
            ready: Mutex::new(VecDeque::with_capacity(config.queue_depth)),
            outstanding: AtomicUsize::new(0),
            queue_depth: config.queue_depth,
            closed: AtomicBool::new(false),
            reorder: config.reorder_seed.map(|seed| Mutex::new(StdRng::seed_from_u64(seed))),
            submissions: Mutex::new(VecDeque::new()),
            submitted: Condvar::new(),
        });

        let worker = if config.worker {
            let shared = shared.clone();
            let mask = config.submission_core_mask;
            let handle = std::thread::Builder::new()
                .name("kvudd-submit".to_string())
                .spawn(move || {
                    affinity::pin_or_warn(mask, "submission worker");
                    shared.run_worker();
                })?;
            Some(handle)
        } else {
            None
        };

        tracing::info!(
            "Memory engine opened: depth={}, capacity={}B, persistent={}, worker={}",
            config.queue_depth,
            config.capacity_bytes,
            config.persistent,
            config.worker
        );

        Ok(Self {
            shared,
            worker: Mutex::new(worker),
            config,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Number of stored keys across all containers.
    pub fn len(&self) -> usize {
        self.shared.store.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.store.data.is_empty()
    }

    fn stop_worker(&self) {
        self.shared.closed.store(true, Ordering::Release);
        {
            // hold the queue lock so the worker cannot miss the wakeup
            let _queue = self.shared.submissions.lock().unwrap_or_else(PoisonError::into_inner);
            self.shared.submitted.notify_all();
        }
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Submission worker panicked");
            }
        }
    }

    fn write_snapshot(&self) -> Result<()> {
        let mut writer = SnapshotWriter::new(self.config.checksum_algorithm);
        for entry in self.shared.store.data.iter() {
            let (container, key) = entry.key();
            writer.push(*container, key, entry.value());
        }
        let count = writer.finish(&self.config.path)?;
        tracing::info!("Snapshot saved: {} keys to {:?}", count, self.config.path);
        Ok(())
    }
}

fn load_snapshot(config: &MemoryEngineConfig, store: &Store) -> Result<()> {
    let path = &config.path;
    if path.is_dir() {
        return Err(AdapterError::InitFailure(format!(
            "device path {:?} is a directory",
            path
        )));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(AdapterError::InitFailure(format!(
                "parent directory of {:?} does not exist",
                path
            )));
        }
    }
    if !path.exists() {
        tracing::info!("No snapshot at {:?}, starting empty", path);
        return Ok(());
    }

    let records = read_snapshot(path)
        .map_err(|e| AdapterError::InitFailure(format!("cannot restore {:?}: {}", path, e)))?;
    let mut used = 0u64;
    for record in records {
        if record.key.len() > MAX_KEY_LEN {
            return Err(AdapterError::InitFailure(format!(
                "snapshot {:?} holds a key longer than {} bytes",
                path, MAX_KEY_LEN
            )));
        }
        used += (record.key.len() + record.value.len()) as u64;
        store.data.insert((record.container, record.key), record.value);
    }
    store.used_bytes.store(used, Ordering::Relaxed);

    tracing::info!("Restored {} keys from {:?}", store.data.len(), path);
    Ok(())
}

impl KvEngine for MemoryEngine {
    fn submit(&self, token: CorrelationToken, command: Command) -> std::result::Result<(), Rejection> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Rejection {
                command,
                error: SubmitError::Closed,
            });
        }
        let prev = self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        if prev >= self.shared.queue_depth {
            self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(Rejection {
                command,
                error: SubmitError::QueueFull,
            });
        }

        if self.config.worker {
            let mut queue = self.shared.submissions.lock().unwrap_or_else(PoisonError::into_inner);
            queue.push_back((token, command));
            self.shared.submitted.notify_one();
        } else {
            self.shared.complete(token, command);
        }
        Ok(())
    }

    fn poll(&self, max: usize, out: &mut Vec<EngineCompletion>) -> usize {
        let mut ready = self.shared.ready.lock().unwrap_or_else(PoisonError::into_inner);
        if ready.is_empty() {
            return 0;
        }
        if let Some(rng) = &self.shared.reorder {
            let mut rng = rng.lock().unwrap_or_else(PoisonError::into_inner);
            ready.make_contiguous().shuffle(&mut *rng);
        }

        let n = if max == 0 { ready.len() } else { max.min(ready.len()) };
        out.extend(ready.drain(..n));
        self.shared.outstanding.fetch_sub(n, Ordering::AcqRel);
        n
    }

    fn pending(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    fn used_size(&self) -> Result<u32> {
        let used = self.shared.store.used_bytes.load(Ordering::Relaxed);
        let ratio = used.saturating_mul(10_000) / self.shared.store.capacity.max(1);
        Ok(ratio.min(10_000) as u32)
    }

    fn total_size(&self) -> Result<u64> {
        Ok(self.shared.store.capacity)
    }

    fn waf(&self) -> f32 {
        let host = self.shared.store.host_bytes_written.load(Ordering::Relaxed);
        if host == 0 {
            return 1.0;
        }
        let media = self.shared.store.media_bytes_written.load(Ordering::Relaxed);
        media as f32 / host as f32
    }

    fn device_info(&self) -> Result<DeviceInfo> {
        Ok(DeviceInfo {
            capacity: self.shared.store.capacity,
            max_key_len: MAX_KEY_LEN as u32,
            max_value_len: self.shared.store.max_value_len as u32,
            optimal_value_len: OPTIMAL_VALUE_LEN,
            queue_depth: self.shared.queue_depth as u32,
            max_iterators: self.shared.store.max_iterators,
            persistent: self.config.persistent,
        })
    }

    fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_worker();
        if self.config.persistent {
            self.write_snapshot()?;
        }
        tracing::info!("Memory engine shut down");
        Ok(())
    }
}

impl Drop for MemoryEngine {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use tempfile::TempDir;

    fn token(n: u32) -> CorrelationToken {
        CorrelationToken::new(n, 0)
    }

    fn run(engine: &MemoryEngine, command: Command) -> EngineCompletion {
        engine.submit(token(0), command).unwrap();
        let mut out = Vec::new();
        // worker mode may need a moment
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if engine.poll(1, &mut out) == 1 {
                return out.pop().unwrap();
            }
            std::thread::yield_now();
        }
        panic!("command never completed");
    }

    fn buffer(pool: &mut BufferPool, key: &[u8], value: &[u8]) -> PairBuffer {
        let mut buf = pool.acquire().unwrap();
        buf.set_key(key);
        buf.stage_value(value);
        buf
    }

    fn store(engine: &MemoryEngine, pool: &mut BufferPool, key: &[u8], value: &[u8], option: StoreOption) -> KvStatus {
        let buffer = buffer(pool, key, value);
        let done = run(engine, Command::Store { container: 0, option, buffer });
        if let CommandOutput::Buffer(buf) = done.output {
            pool.release(buf);
        }
        done.status
    }

    fn retrieve(engine: &MemoryEngine, pool: &mut BufferPool, key: &[u8], window: usize) -> (KvStatus, Vec<u8>, usize) {
        let mut buf = buffer(pool, key, b"");
        buf.set_window(window);
        let done = run(engine, Command::Retrieve { container: 0, option: RetrieveOption::Default, buffer: buf });
        match done.output {
            CommandOutput::Buffer(buf) => {
                let result = (done.status, buf.value().to_vec(), buf.actual_len());
                pool.release(buf);
                result
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_store_and_retrieve() {
        let engine = MemoryEngine::open(MemoryEngineConfig::new(8)).unwrap();
        let mut pool = BufferPool::new(2, 64);

        assert_eq!(store(&engine, &mut pool, b"key1", b"value1", StoreOption::Overwrite), KvStatus::Success);
        let (status, value, len) = retrieve(&engine, &mut pool, b"key1", 64);
        assert_eq!(status, KvStatus::Success);
        assert_eq!(value, b"value1");
        assert_eq!(len, 6);

        let (status, _, _) = retrieve(&engine, &mut pool, b"nope", 64);
        assert_eq!(status, KvStatus::KeyNotFound);
    }

    #[test]
    fn test_store_options() {
        let engine = MemoryEngine::open(MemoryEngineConfig::new(8)).unwrap();
        let mut pool = BufferPool::new(2, 64);

        assert_eq!(store(&engine, &mut pool, b"key1", b"a", StoreOption::UpdateOnly), KvStatus::KeyNotFound);
        assert_eq!(store(&engine, &mut pool, b"key1", b"a", StoreOption::NoOverwrite), KvStatus::Success);
        assert_eq!(store(&engine, &mut pool, b"key1", b"b", StoreOption::NoOverwrite), KvStatus::KeyExists);
        assert_eq!(store(&engine, &mut pool, b"key1", b"bc", StoreOption::Append), KvStatus::Success);

        let (_, value, _) = retrieve(&engine, &mut pool, b"key1", 64);
        assert_eq!(value, b"abc");
        assert!(engine.waf() > 1.0);
    }

    #[test]
    fn test_truncated_retrieve_reports_full_length() {
        let engine = MemoryEngine::open(MemoryEngineConfig::new(8)).unwrap();
        let mut pool = BufferPool::new(2, 64);
        store(&engine, &mut pool, b"key1", b"0123456789", StoreOption::Overwrite);

        let (status, value, len) = retrieve(&engine, &mut pool, b"key1", 4);
        assert_eq!(status, KvStatus::BufferTooSmall);
        assert_eq!(value, b"0123");
        assert_eq!(len, 10);
    }

    #[test]
    fn test_queue_full_until_polled() {
        let engine = MemoryEngine::open(MemoryEngineConfig::new(2)).unwrap();
        let close = |n| Command::CloseIterator { handle: IteratorHandle(n) };

        assert!(engine.submit(token(0), close(1)).is_ok());
        assert!(engine.submit(token(1), close(2)).is_ok());
        let rejected = engine.submit(token(2), close(3)).unwrap_err();
        assert_eq!(rejected.error, SubmitError::QueueFull);
        assert_eq!(engine.pending(), 2);

        let mut out = Vec::new();
        assert_eq!(engine.poll(0, &mut out), 2);
        assert_eq!(engine.pending(), 0);
        assert!(out.iter().all(|c| c.status == KvStatus::IteratorNotFound));
        assert_eq!(engine.poll(0, &mut out), 0);
    }

    #[test]
    fn test_delete_options() {
        let engine = MemoryEngine::open(MemoryEngineConfig::new(8)).unwrap();
        let mut pool = BufferPool::new(2, 64);

        let missing = buffer(&mut pool, b"gone", b"");
        let done = run(&engine, Command::Delete { container: 0, option: DeleteOption::Default, buffer: missing });
        assert_eq!(done.status, KvStatus::Success);
        if let CommandOutput::Buffer(buf) = done.output {
            pool.release(buf);
        }

        let missing = buffer(&mut pool, b"gone", b"");
        let done = run(&engine, Command::Delete { container: 0, option: DeleteOption::ErrorIfMissing, buffer: missing });
        assert_eq!(done.status, KvStatus::KeyNotFound);
    }

    #[test]
    fn test_exist_codes() {
        let engine = MemoryEngine::open(MemoryEngineConfig::new(8)).unwrap();
        let mut pool = BufferPool::new(2, 64);
        store(&engine, &mut pool, b"key1", b"v", StoreOption::Overwrite);

        let done = run(&engine, Command::Exist {
            container: 0,
            keys: vec![b"key1".to_vec(), b"key2".to_vec()],
            result: vec![0xAA; 2],
        });
        match done.output {
            CommandOutput::Exist(codes) => assert_eq!(codes, vec![EXIST_PRESENT, EXIST_ABSENT]),
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_iterator_batches_and_end() {
        let engine = MemoryEngine::open(MemoryEngineConfig::new(8)).unwrap();
        let mut pool = BufferPool::new(2, 64);
        for key in [b"aaa1", b"aaa2", b"aaa3", b"bbb1"] {
            store(&engine, &mut pool, key, b"v", StoreOption::Overwrite);
        }

        let filter = PrefixFilter::new(0xFF00_0000, u32::from_be_bytes(*b"a\0\0\0"));
        let done = run(&engine, Command::OpenIterator { container: 0, option: IteratorOption::KeyOnly, filter });
        let CommandOutput::Iterator(handle) = done.output else { panic!("no handle") };

        // 16 bytes fits two 4-byte keys
        let mut seen = Vec::new();
        loop {
            let done = run(&engine, Command::IteratorNext { handle, list: IteratorList::with_capacity(16) });
            let CommandOutput::List(list) = done.output else { panic!("no list") };
            seen.extend(list.entries().iter().map(|e| e.key.clone()));
            if done.status == KvStatus::IteratorEnd || list.is_end() {
                break;
            }
            assert_eq!(done.status, KvStatus::Success);
        }
        assert_eq!(seen, vec![b"aaa1".to_vec(), b"aaa2".to_vec(), b"aaa3".to_vec()]);

        let done = run(&engine, Command::IteratorNext { handle, list: IteratorList::with_capacity(16) });
        assert_eq!(done.status, KvStatus::IteratorEnd);

        assert_eq!(run(&engine, Command::CloseIterator { handle }).status, KvStatus::Success);
        assert_eq!(run(&engine, Command::CloseIterator { handle }).status, KvStatus::IteratorNotFound);
    }

    #[test]
    fn test_iterator_entry_larger_than_list() {
        let engine = MemoryEngine::open(MemoryEngineConfig::new(8)).unwrap();
        let mut pool = BufferPool::new(2, 64);
        store(&engine, &mut pool, b"key1", &[7u8; 32], StoreOption::Overwrite);

        let done = run(&engine, Command::OpenIterator {
            container: 0,
            option: IteratorOption::KeyValue,
            filter: PrefixFilter::all(),
        });
        let CommandOutput::Iterator(handle) = done.output else { panic!("no handle") };

        let done = run(&engine, Command::IteratorNext { handle, list: IteratorList::with_capacity(16) });
        assert_eq!(done.status, KvStatus::BufferTooSmall);

        // cursor did not advance
        let done = run(&engine, Command::IteratorNext { handle, list: IteratorList::with_capacity(64) });
        assert_eq!(done.status, KvStatus::Success);
        let CommandOutput::List(list) = done.output else { panic!("no list") };
        assert_eq!(list.len(), 1);
        assert!(list.is_end());
    }

    #[test]
    fn test_too_many_iterators() {
        let engine = MemoryEngine::open(MemoryEngineConfig::new(8).with_max_iterators(1)).unwrap();
        let open = || Command::OpenIterator {
            container: 0,
            option: IteratorOption::KeyOnly,
            filter: PrefixFilter::all(),
        };
        assert_eq!(run(&engine, open()).status, KvStatus::Success);
        assert_eq!(run(&engine, open()).status, KvStatus::TooManyIterators);
    }

    #[test]
    fn test_device_full() {
        let engine = MemoryEngine::open(MemoryEngineConfig::new(8).with_capacity_bytes(16)).unwrap();
        let mut pool = BufferPool::new(2, 64);
        assert_eq!(store(&engine, &mut pool, b"key1", b"12345678", StoreOption::Overwrite), KvStatus::Success);
        assert_eq!(store(&engine, &mut pool, b"key2", b"12345678", StoreOption::Overwrite), KvStatus::DeviceFull);
        assert_eq!(engine.used_size().unwrap(), 7500);
    }

    #[test]
    fn test_worker_mode_completes() {
        let engine = MemoryEngine::open(MemoryEngineConfig::new(8).with_worker(true)).unwrap();
        let mut pool = BufferPool::new(2, 64);
        assert_eq!(store(&engine, &mut pool, b"key1", b"v", StoreOption::Overwrite), KvStatus::Success);
        engine.shutdown().unwrap();

        let rejected = engine
            .submit(token(1), Command::CloseIterator { handle: IteratorHandle(1) })
            .unwrap_err();
        assert_eq!(rejected.error, SubmitError::Closed);
    }

    #[test]
    fn test_reorder_keeps_every_completion() {
        let engine = MemoryEngine::open(MemoryEngineConfig::new(16).with_reorder_seed(7)).unwrap();
        for n in 0..10 {
            engine.submit(token(n), Command::CloseIterator { handle: IteratorHandle(n) }).unwrap();
        }
        let mut out = Vec::new();
        engine.poll(0, &mut out);
        let mut indices: Vec<u32> = out.iter().map(|c| c.token.index()).collect();
        indices.sort();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device.snap");
        let mut pool = BufferPool::new(2, 64);

        let engine = MemoryEngine::open(MemoryEngineConfig::new(8).with_persistence(path.clone())).unwrap();
        store(&engine, &mut pool, b"key1", b"persisted", StoreOption::Overwrite);
        engine.shutdown().unwrap();
        drop(engine);

        let engine = MemoryEngine::open(MemoryEngineConfig::new(8).with_persistence(path)).unwrap();
        assert_eq!(engine.len(), 1);
        let (status, value, _) = retrieve(&engine, &mut pool, b"key1", 64);
        assert_eq!(status, KvStatus::Success);
        assert_eq!(value, b"persisted");
    }

    #[test]
    fn test_persistent_open_rejects_bad_paths() {
        let dir = TempDir::new().unwrap();

        let result = MemoryEngine::open(MemoryEngineConfig::new(8).with_persistence(dir.path().to_path_buf()));
        assert!(matches!(result, Err(AdapterError::InitFailure(_))));

        let missing = dir.path().join("missing").join("device.snap");
        let result = MemoryEngine::open(MemoryEngineConfig::new(8).with_persistence(missing));
        assert!(matches!(result, Err(AdapterError::InitFailure(_))));

        let corrupt = dir.path().join("corrupt.snap");
        std::fs::write(&corrupt, b"garbage").unwrap();
        let result = MemoryEngine::open(MemoryEngineConfig::new(8).with_persistence(corrupt));
        assert!(matches!(result, Err(AdapterError::InitFailure(_))));
    }
}
