use crate::checksum::ChecksumAlgorithm;
use crate::error::{AdapterError, Result};
use crate::types::MAX_VALUE_LEN;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Behaviour of pool acquisition when no idle context or buffer remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PoolPolicy {
    /// Fail immediately with `PoolExhausted`.
    #[default]
    FailFast,
    /// Wait for a release, driving the reaper meanwhile, up to `timeout_ms`.
    Block {
        /// Maximum time to wait for an item in milliseconds.
        timeout_ms: u64,
    },
}

/// Whether `process_completions` may run on several threads at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReaperPolicy {
    /// One reaper at a time; a concurrent call returns 0 immediately.
    #[default]
    Exclusive,
    /// Reapers run concurrently; the engine must hand out each completion once.
    Shared,
}

/// Configuration for a device session.
///
/// Use the builder pattern methods to customize settings.
///
/// # Example
///
/// ```
/// use kvudd::Config;
/// use std::path::PathBuf;
///
/// let config = Config::new(PathBuf::from("./device.snap"))
///     .with_queue_depth(64)
///     .with_completion_threads(2)
///     .with_dma_memory_mb(16);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backing path identifier of the device.
    ///
    /// For the in-process engine this is the snapshot file used when
    /// `persistent` is set.
    pub device_path: PathBuf,

    /// Keep data across sessions (default: false).
    pub persistent: bool,

    /// Caller-driven completion mode (default: false).
    ///
    /// When set, no completion threads are started and completions are only
    /// reaped by `process_completions` and by synchronous calls.
    pub sync_io: bool,

    /// Maximum number of simultaneously in-flight requests (default: 256).
    ///
    /// Sizes the context pool. Valid range: 1 - 4096.
    pub queue_depth: u32,

    /// Core mask for the engine submission worker (0 = unpinned).
    pub submission_core_mask: u64,

    /// Core mask for completion threads (0 = unpinned).
    pub completion_core_mask: u64,

    /// Number of background completion threads (default: 1).
    ///
    /// Valid range: 0 - 64; must be at least 1 unless `sync_io` is set.
    pub completion_threads: u32,

    /// DMA staging memory in MB (default: 64MB).
    ///
    /// Divided into buffers of `max_value_size`; must yield at least
    /// `queue_depth` buffers.
    pub dma_memory_mb: u32,

    /// Capacity of each value staging buffer in bytes (default: 64KB).
    pub max_value_size: u32,

    /// Maximum number of concurrently open iterators (default: 16).
    pub max_iterators: u32,

    /// Pool exhaustion policy.
    pub pool_policy: PoolPolicy,

    /// Reaper concurrency contract.
    pub reaper_policy: ReaperPolicy,

    /// Completions drained per reaper pass by synchronous waiters (default: 32).
    pub reap_batch: u32,

    /// How long a synchronous waiter sleeps between reaper passes, in microseconds.
    pub sync_wait_slice_us: u64,

    /// Idle sleep of a completion thread between empty polls, in microseconds.
    pub poll_interval_us: u64,

    /// Deadline for draining in-flight work on close, in milliseconds.
    pub drain_timeout_ms: u64,

    /// Device capacity in bytes reported by the in-process engine (default: 1GB).
    pub capacity_bytes: u64,

    /// Checksum algorithm protecting snapshot records.
    pub checksum_algorithm: ChecksumAlgorithm,
}

impl Config {
    /// Creates a new configuration with the given device path and default values.
    ///
    /// # Default Values
    ///
    /// - Queue depth: 256
    /// - Completion threads: 1, unpinned
    /// - DMA memory: 64MB of 64KB buffers
    /// - Max iterators: 16
    /// - Pool policy: fail fast
    /// - Reaper policy: exclusive
    /// - Drain timeout: 5s
    /// - Checksum: CRC32
    pub fn new(device_path: PathBuf) -> Self {
        Self {
            device_path,
            persistent: false,
            sync_io: false,
            queue_depth: 256,
            submission_core_mask: 0,
            completion_core_mask: 0,
            completion_threads: 1,
            dma_memory_mb: 64,
            max_value_size: 64 * 1024,
            max_iterators: 16,
            pool_policy: PoolPolicy::FailFast,
            reaper_policy: ReaperPolicy::Exclusive,
            reap_batch: 32,
            sync_wait_slice_us: 200,
            poll_interval_us: 50,
            drain_timeout_ms: 5000,
            capacity_bytes: 1024 * 1024 * 1024,
            checksum_algorithm: ChecksumAlgorithm::CRC32,
        }
    }

    /// Number of staging buffers the DMA memory is divided into.
    pub fn buffer_count(&self) -> usize {
        if self.max_value_size == 0 {
            return 0;
        }
        (self.dma_memory_mb as u64 * 1024 * 1024 / self.max_value_size as u64) as usize
    }

    /// Validates the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any parameter is invalid:
    /// - Empty device path
    /// - Queue depth < 1 or > 4096
    /// - Completion threads > 64, or 0 without `sync_io`
    /// - Value buffer size of 0 or above 2MB
    /// - DMA memory too small for one buffer per queue slot
    /// - Max iterators < 1 or > 64
    /// - Zero reap batch or capacity
    pub fn validate(&self) -> Result<()> {
        if self.device_path.as_os_str().is_empty() {
            return Err(AdapterError::ConfigError(
                "device_path cannot be empty".to_string()
            ));
        }

        if self.queue_depth < 1 {
            return Err(AdapterError::ConfigError(
                "queue_depth must be at least 1".to_string()
            ));
        }
        if self.queue_depth > 4096 {
            return Err(AdapterError::ConfigError(
                "queue_depth cannot exceed 4096".to_string()
            ));
        }

        if self.completion_threads > 64 {
            return Err(AdapterError::ConfigError(
                "completion_threads cannot exceed 64".to_string()
            ));
        }
        if !self.sync_io && self.completion_threads == 0 {
            return Err(AdapterError::ConfigError(
                "completion_threads must be at least 1 unless sync_io is set".to_string()
            ));
        }

        if self.max_value_size == 0 {
            return Err(AdapterError::ConfigError(
                "max_value_size must be at least 1".to_string()
            ));
        }
        if self.max_value_size as usize > MAX_VALUE_LEN {
            return Err(AdapterError::ConfigError(
                format!("max_value_size cannot exceed {}", MAX_VALUE_LEN)
            ));
        }

        if self.buffer_count() < self.queue_depth as usize {
            return Err(AdapterError::ConfigError(format!(
                "dma_memory_mb ({}MB) holds {} buffers of {} bytes, queue_depth {} needs at least as many",
                self.dma_memory_mb,
                self.buffer_count(),
                self.max_value_size,
                self.queue_depth
            )));
        }

        if self.max_iterators < 1 || self.max_iterators > 64 {
            return Err(AdapterError::ConfigError(
                "max_iterators must be between 1 and 64".to_string()
            ));
        }

        if self.reap_batch < 1 {
            return Err(AdapterError::ConfigError(
                "reap_batch must be at least 1".to_string()
            ));
        }

        if self.capacity_bytes == 0 {
            return Err(AdapterError::ConfigError(
                "capacity_bytes must be at least 1".to_string()
            ));
        }

        if let PoolPolicy::Block { timeout_ms } = self.pool_policy {
            if timeout_ms == 0 {
                return Err(AdapterError::ConfigError(
                    "blocking pool policy needs a non-zero timeout".to_string()
                ));
            }
        }

        Ok(())
    }

    /// Load a configuration previously written with [`Config::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Set persistence
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Set caller-driven completion mode
    pub fn with_sync_io(mut self, sync_io: bool) -> Self {
        self.sync_io = sync_io;
        self
    }

    /// Set queue depth
    pub fn with_queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set submission core mask
    pub fn with_submission_core_mask(mut self, mask: u64) -> Self {
        self.submission_core_mask = mask;
        self
    }

    /// Set completion core mask
    pub fn with_completion_core_mask(mut self, mask: u64) -> Self {
        self.completion_core_mask = mask;
        self
    }

    /// Set number of completion threads
    pub fn with_completion_threads(mut self, threads: u32) -> Self {
        self.completion_threads = threads;
        self
    }

    /// Set DMA memory size
    pub fn with_dma_memory_mb(mut self, mb: u32) -> Self {
        self.dma_memory_mb = mb;
        self
    }

    /// Set value buffer size
    pub fn with_max_value_size(mut self, size: u32) -> Self {
        self.max_value_size = size;
        self
    }

    /// Set iterator limit
    pub fn with_max_iterators(mut self, max: u32) -> Self {
        self.max_iterators = max;
        self
    }

    /// Set pool exhaustion policy
    pub fn with_pool_policy(mut self, policy: PoolPolicy) -> Self {
        self.pool_policy = policy;
        self
    }

    /// Set reaper concurrency policy
    pub fn with_reaper_policy(mut self, policy: ReaperPolicy) -> Self {
        self.reaper_policy = policy;
        self
    }

    /// Set reaper batch size for synchronous waiters
    pub fn with_reap_batch(mut self, batch: u32) -> Self {
        self.reap_batch = batch;
        self
    }

    /// Set drain timeout
    pub fn with_drain_timeout(mut self, timeout_ms: u64) -> Self {
        self.drain_timeout_ms = timeout_ms;
        self
    }

    /// Set device capacity
    pub fn with_capacity_bytes(mut self, capacity: u64) -> Self {
        self.capacity_bytes = capacity;
        self
    }

    /// Set checksum algorithm
    pub fn with_checksum_algorithm(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.checksum_algorithm = algorithm;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(PathBuf::from("./kvudd.snap"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_values() {
        let config = Config::new(PathBuf::from("/tmp/test.snap"));

        assert_eq!(config.queue_depth, 256);
        assert_eq!(config.completion_threads, 1);
        assert_eq!(config.dma_memory_mb, 64);
        assert_eq!(config.max_value_size, 64 * 1024);
        assert_eq!(config.buffer_count(), 1024);
        assert_eq!(config.pool_policy, PoolPolicy::FailFast);
        assert_eq!(config.reaper_policy, ReaperPolicy::Exclusive);
        assert!(!config.persistent);
        assert!(!config.sync_io);
    }

    #[test]
    fn test_config_validation_success() {
        let config = Config::new(PathBuf::from("/tmp/test.snap"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_empty_device_path() {
        let config = Config::new(PathBuf::from(""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_queue_depth_bounds() {
        let config = Config::new(PathBuf::from("/tmp/test.snap")).with_queue_depth(0);
        assert!(config.validate().is_err());

        let config = Config::new(PathBuf::from("/tmp/test.snap")).with_queue_depth(5000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_dma_too_small_for_queue() {
        // 1MB of 64KB buffers = 16 buffers, fewer than 32 queue slots
        let config = Config::new(PathBuf::from("/tmp/test.snap"))
            .with_queue_depth(32)
            .with_dma_memory_mb(1);
        assert!(config.validate().is_err());

        let config = config.with_max_value_size(4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_completion_threads() {
        let config = Config::new(PathBuf::from("/tmp/test.snap")).with_completion_threads(0);
        assert!(config.validate().is_err());

        let config = config.with_sync_io(true);
        assert!(config.validate().is_ok());

        let config = Config::new(PathBuf::from("/tmp/test.snap")).with_completion_threads(65);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_value_size() {
        let config = Config::new(PathBuf::from("/tmp/test.snap")).with_max_value_size(0);
        assert!(config.validate().is_err());

        let config = Config::new(PathBuf::from("/tmp/test.snap"))
            .with_max_value_size(4 * 1024 * 1024)
            .with_dma_memory_mb(2048);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_block_policy_needs_timeout() {
        let config = Config::new(PathBuf::from("/tmp/test.snap"))
            .with_pool_policy(PoolPolicy::Block { timeout_ms: 0 });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_builder_pattern() {
        let config = Config::new(PathBuf::from("/tmp/test.snap"))
            .with_queue_depth(64)
            .with_completion_threads(4)
            .with_completion_core_mask(0b1111)
            .with_dma_memory_mb(8)
            .with_max_value_size(4096)
            .with_reaper_policy(ReaperPolicy::Shared)
            .with_persistent(true);

        assert_eq!(config.queue_depth, 64);
        assert_eq!(config.completion_threads, 4);
        assert_eq!(config.completion_core_mask, 0b1111);
        assert_eq!(config.buffer_count(), 2048);
        assert_eq!(config.reaper_policy, ReaperPolicy::Shared);
        assert!(config.persistent);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::new(dir.path().join("device.snap"))
            .with_queue_depth(48)
            .with_pool_policy(PoolPolicy::Block { timeout_ms: 25 });
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.queue_depth, 48);
        assert_eq!(loaded.pool_policy, PoolPolicy::Block { timeout_ms: 25 });
        assert_eq!(loaded.device_path, dir.path().join("device.snap"));
    }
}
