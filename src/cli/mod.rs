use crate::error::{AdapterError, Result};
use crate::types::ContainerId;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "kvudd")]
#[command(about = "Key-value device adapter over a polled completion-queue engine", long_about = None)]
pub struct Command {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a persistent device at specified path
    Init {
        /// Device directory path
        #[arg(short, long)]
        path: PathBuf,

        /// Maximum in-flight requests
        #[arg(short, long, default_value = "256")]
        queue_depth: u32,

        /// Background completion threads
        #[arg(short, long, default_value = "1")]
        completion_threads: u32,

        /// DMA staging memory in MB
        #[arg(short, long, default_value = "64")]
        dma_mb: u32,
    },

    /// Store a key-value pair
    Put {
        /// Key to store
        key: String,

        /// Value to store
        value: String,

        /// Device directory path
        #[arg(short, long, default_value = "./data")]
        path: PathBuf,

        /// Container identifier
        #[arg(short, long, default_value = "0")]
        container: ContainerId,
    },

    /// Retrieve value for a key
    Get {
        /// Key to retrieve
        key: String,

        /// Device directory path
        #[arg(short, long, default_value = "./data")]
        path: PathBuf,

        /// Container identifier
        #[arg(short, long, default_value = "0")]
        container: ContainerId,
    },

    /// Delete a key
    Delete {
        /// Key to delete
        key: String,

        /// Device directory path
        #[arg(short, long, default_value = "./data")]
        path: PathBuf,

        /// Container identifier
        #[arg(short, long, default_value = "0")]
        container: ContainerId,
    },

    /// Check which keys exist
    Exist {
        /// Keys to check
        #[arg(required = true)]
        keys: Vec<String>,

        /// Device directory path
        #[arg(short, long, default_value = "./data")]
        path: PathBuf,

        /// Container identifier
        #[arg(short, long, default_value = "0")]
        container: ContainerId,
    },

    /// List keys whose first four bytes match a bit pattern
    Scan {
        /// Mask over the big-endian key prefix (decimal or 0x-prefixed hex)
        #[arg(short, long, default_value = "0", value_parser = parse_u32)]
        bitmask: u32,

        /// Required prefix bits under the mask
        #[arg(long, default_value = "0", value_parser = parse_u32)]
        pattern: u32,

        /// Device directory path
        #[arg(short, long, default_value = "./data")]
        path: PathBuf,

        /// Container identifier
        #[arg(short, long, default_value = "0")]
        container: ContainerId,
    },

    /// Display device statistics
    Info {
        /// Device directory path
        #[arg(short, long, default_value = "./data")]
        path: PathBuf,
    },

    /// Run an asynchronous store/retrieve benchmark
    Bench {
        /// Total operations per phase
        #[arg(short, long, default_value = "100000")]
        ops: u64,

        /// Value size in bytes
        #[arg(short, long, default_value = "128")]
        value_size: usize,

        /// Concurrent tasks
        #[arg(long, default_value = "16")]
        concurrency: usize,

        /// Device directory path
        #[arg(short, long, default_value = "./data")]
        path: PathBuf,

        /// Container identifier
        #[arg(short, long, default_value = "0")]
        container: ContainerId,
    },
}

pub async fn execute_command(cmd: Command) -> Result<()> {
    match cmd.command {
        Commands::Init { path, queue_depth, completion_threads, dma_mb } => {
            execute_init_command(path, queue_depth, completion_threads, dma_mb).await
        }
        Commands::Put { key, value, path, container } => {
            execute_put_command(key, value, path, container).await
        }
        Commands::Get { key, path, container } => {
            execute_get_command(key, path, container).await
        }
        Commands::Delete { key, path, container } => {
            execute_delete_command(key, path, container).await
        }
        Commands::Exist { keys, path, container } => {
            execute_exist_command(keys, path, container).await
        }
        Commands::Scan { bitmask, pattern, path, container } => {
            execute_scan_command(bitmask, pattern, path, container).await
        }
        Commands::Info { path } => execute_info_command(path).await,
        Commands::Bench { ops, value_size, concurrency, path, container } => {
            execute_bench_command(ops, value_size, concurrency, path, container).await
        }
    }
}

async fn execute_init_command(
    path: PathBuf,
    queue_depth: u32,
    completion_threads: u32,
    dma_mb: u32,
) -> Result<()> {
    use crate::config::Config;

    println!("Initializing kvudd device at: {}", path.display());

    std::fs::create_dir_all(&path)?;
    println!("  ✓ Created device directory");

    let config = Config::new(path.join("device.snap"))
        .with_persistent(true)
        .with_queue_depth(queue_depth)
        .with_completion_threads(completion_threads)
        .with_dma_memory_mb(dma_mb);

    config.validate()?;

    let config_path = path.join("config.json");
    config.save(&config_path)?;

    println!("  ✓ Created configuration file: {}", config_path.display());
    println!("\nConfiguration:");
    println!("  Queue depth: {}", queue_depth);
    println!("  Completion threads: {}", completion_threads);
    println!("  DMA memory: {} MB ({} buffers)", dma_mb, config.buffer_count());
    println!("  Max value size: {} bytes", config.max_value_size);
    println!("\nDevice initialized successfully!");

    Ok(())
}

async fn execute_put_command(key: String, value: String, path: PathBuf, container: ContainerId) -> Result<()> {
    use crate::session::{IoOptions, Session};
    use crate::types::StoreOption;

    let session = Session::open(load_config_from_path(&path)?)?;

    let outcome = session
        .store(container, key.as_bytes(), value.as_bytes(), StoreOption::Overwrite, IoOptions::sync())?
        .into_outcome();
    check_outcome(crate::types::OpKind::Store, outcome.map(|o| o.status))?;

    println!("✓ Put key: {}", key);

    session.close()?;
    Ok(())
}

async fn execute_get_command(key: String, path: PathBuf, container: ContainerId) -> Result<()> {
    use crate::session::{IoOptions, Session};
    use crate::types::{KvStatus, RetrieveOption};

    let config = load_config_from_path(&path)?;
    let capacity = config.max_value_size as usize;
    let session = Session::open(config)?;

    let outcome = session
        .retrieve(container, key.as_bytes(), capacity, RetrieveOption::Default, IoOptions::sync())?
        .into_outcome();
    match outcome {
        Some(outcome) if outcome.status == KvStatus::Success => {
            let value = outcome.value.unwrap_or_default();
            println!("{}", String::from_utf8_lossy(&value));
        }
        Some(outcome) if outcome.status == KvStatus::KeyNotFound => {
            println!("Key not found: {}", key);
        }
        other => check_outcome(crate::types::OpKind::Retrieve, other.map(|o| o.status))?,
    }

    session.close()?;
    Ok(())
}

async fn execute_delete_command(key: String, path: PathBuf, container: ContainerId) -> Result<()> {
    use crate::session::{IoOptions, Session};
    use crate::types::DeleteOption;

    let session = Session::open(load_config_from_path(&path)?)?;

    let outcome = session
        .delete(container, key.as_bytes(), DeleteOption::Default, IoOptions::sync())?
        .into_outcome();
    check_outcome(crate::types::OpKind::Delete, outcome.map(|o| o.status))?;

    println!("✓ Deleted key: {}", key);

    session.close()?;
    Ok(())
}

async fn execute_exist_command(keys: Vec<String>, path: PathBuf, container: ContainerId) -> Result<()> {
    use crate::session::{IoOptions, Session};
    use crate::types::EXIST_PRESENT;

    let session = Session::open(load_config_from_path(&path)?)?;

    let key_bytes: Vec<&[u8]> = keys.iter().map(|k| k.as_bytes()).collect();
    let outcome = session
        .exist(container, &key_bytes, vec![0u8; keys.len()], IoOptions::sync())?
        .into_outcome();
    let codes = outcome.as_ref().and_then(|o| o.exist.clone()).unwrap_or_default();
    check_outcome(crate::types::OpKind::Exist, outcome.map(|o| o.status))?;

    for (key, code) in keys.iter().zip(codes) {
        let state = if code == EXIST_PRESENT { "present" } else { "absent" };
        println!("  {}: {}", key, state);
    }

    session.close()?;
    Ok(())
}

async fn execute_scan_command(bitmask: u32, pattern: u32, path: PathBuf, container: ContainerId) -> Result<()> {
    use crate::session::{IoOptions, Session};
    use crate::types::{IteratorList, IteratorOption, KvStatus, MAX_ITERATOR_BUFFER};

    let session = Session::open(load_config_from_path(&path)?)?;
    let handle = session.open_iterator(container, IteratorOption::KeyValue, bitmask, pattern)?;

    let mut results = Vec::new();
    loop {
        let outcome = session
            .iterator_next(handle, IteratorList::with_capacity(MAX_ITERATOR_BUFFER), IoOptions::sync())?
            .into_outcome();
        let Some(outcome) = outcome else { break };
        match outcome.status {
            KvStatus::Success => {
                let Some(list) = outcome.list else { break };
                let end = list.is_end();
                results.extend(list.into_entries());
                if end {
                    break;
                }
            }
            KvStatus::IteratorEnd => break,
            status => {
                return Err(AdapterError::Engine {
                    op: crate::types::OpKind::IteratorNext,
                    status,
                })
            }
        }
    }
    session.close_iterator(handle)?;

    println!("Found {} entries:", results.len());
    for entry in results {
        let key_str = String::from_utf8_lossy(&entry.key);
        let value_str = String::from_utf8_lossy(entry.value.as_deref().unwrap_or_default());
        println!("  {} = {}", key_str, value_str);
    }

    session.close()?;
    Ok(())
}

async fn execute_info_command(path: PathBuf) -> Result<()> {
    use crate::session::Session;

    let session = Session::open(load_config_from_path(&path)?)?;
    let info = session.device_info()?;
    let used = session.used_size()?;
    let stats = session.pool_stats();

    println!("=== kvudd Device Info ===\n");
    println!("Device:");
    println!("  Capacity: {} bytes", session.total_size()?);
    println!("  Used: {}.{:02}%", used / 100, used % 100);
    println!("  WAF: {:.2}", session.waf());
    println!("  Persistent: {}", info.persistent);
    println!("  Max key length: {}", info.max_key_len);
    println!("  Max value length: {}", info.max_value_len);
    println!("  Optimal value length: {}", info.optimal_value_len);
    println!("  Max iterators: {}", info.max_iterators);
    println!();
    println!("Pools:");
    println!("  Contexts: {} idle / {} total", stats.contexts_idle, stats.contexts_capacity);
    println!("  Buffers: {} idle / {} total", stats.buffers_idle, stats.buffers_capacity);

    session.close()?;
    Ok(())
}

async fn execute_bench_command(
    ops: u64,
    value_size: usize,
    concurrency: usize,
    path: PathBuf,
    container: ContainerId,
) -> Result<()> {
    use crate::async_session::AsyncSession;
    use crate::session::Session;
    use crate::types::{RetrieveOption, StoreOption};
    use std::sync::Arc;
    use std::time::Instant;

    if concurrency == 0 {
        return Err(AdapterError::ConfigError("concurrency must be at least 1".to_string()));
    }

    let config = load_config_from_path(&path)?;
    if value_size > config.max_value_size as usize {
        return Err(AdapterError::ConfigError(format!(
            "value size {} exceeds max_value_size {}",
            value_size, config.max_value_size
        )));
    }

    println!("=== kvudd Benchmark ===");
    println!("Configuration:");
    println!("  Operations: {}", ops);
    println!("  Value size: {} bytes", value_size);
    println!("  Concurrency: {}", concurrency);
    println!("  Device path: {}", path.display());
    println!();

    let session = Arc::new(Session::open(config)?);
    let db = AsyncSession::new(session.clone())?;

    for phase in ["store", "retrieve"] {
        let start_time = Instant::now();
        let mut tasks = Vec::with_capacity(concurrency);
        for worker in 0..concurrency as u64 {
            let db = db.clone();
            tasks.push(tokio::spawn(async move {
                let value = vec![b'v'; value_size];
                let mut failures = 0u64;
                let mut i = worker;
                while i < ops {
                    let key = format!("bench_key_{:010}", i);
                    let result = if phase == "store" {
                        db.store(container, key.as_bytes(), &value, StoreOption::Overwrite).await
                    } else {
                        db.retrieve(container, key.as_bytes(), value_size.max(1), RetrieveOption::Default)
                            .await
                    };
                    match result {
                        Ok(outcome) if outcome.is_success() => {}
                        // back off on pool or queue pressure
                        Err(e) if e.is_retryable() => {
                            tokio::task::yield_now().await;
                            continue;
                        }
                        _ => failures += 1,
                    }
                    i += concurrency as u64;
                }
                failures
            }));
        }

        let mut failures = 0u64;
        for task in tasks {
            failures += task
                .await
                .map_err(|e| AdapterError::InvalidArgument(format!("bench task failed: {}", e)))?;
        }

        let elapsed = start_time.elapsed().as_secs_f64();
        println!(
            "✓ {}: {} ops in {:.2}s ({:.0} ops/sec, {} failures)",
            phase,
            ops,
            elapsed,
            ops as f64 / elapsed.max(f64::EPSILON),
            failures
        );
    }

    let report = session.metrics();
    println!("\nLatency Percentiles (microseconds):");
    for (operation, (p50, p95, p99)) in &report.operation_latencies {
        println!("  {}:", operation);
        println!("    p50: {:.2} µs", p50);
        println!("    p95: {:.2} µs", p95);
        println!("    p99: {:.2} µs", p99);
    }
    println!();
    println!("Counters:");
    println!("  Submitted: {}", report.submitted);
    println!("  Completed: {}", report.completed);
    println!("  Pool exhausted: {}", report.pool_exhausted);
    println!("  Queue full: {}", report.queue_full);

    drop(db);
    session.close()?;
    Ok(())
}

fn check_outcome(op: crate::types::OpKind, status: Option<crate::types::KvStatus>) -> Result<()> {
    match status {
        Some(status) if status.is_success() => Ok(()),
        Some(status) => Err(AdapterError::Engine { op, status }),
        None => Err(AdapterError::Engine {
            op,
            status: crate::types::KvStatus::Device(-1),
        }),
    }
}

fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid 32-bit value '{}': {}", s, e))
}

fn load_config_from_path(device_dir: &Path) -> Result<crate::config::Config> {
    let config_path = device_dir.join("config.json");

    if config_path.exists() {
        crate::config::Config::load(&config_path)
    } else {
        Err(AdapterError::ConfigError(format!(
            "Configuration file not found at {}. Run 'kvudd init --path {}' first.",
            config_path.display(),
            device_dir.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_command() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().to_path_buf();

        let result = execute_init_command(path.clone(), 64, 1, 8).await;
        assert!(result.is_ok());
        assert!(path.join("config.json").exists());

        let config = crate::config::Config::load(&path.join("config.json")).unwrap();
        assert_eq!(config.queue_depth, 64);
        assert!(config.persistent);
        assert_eq!(config.device_path, path.join("device.snap"));
    }

    #[tokio::test]
    async fn test_put_get_delete_commands() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().to_path_buf();
        execute_init_command(path.clone(), 64, 1, 8).await.unwrap();

        execute_put_command("test_key".to_string(), "test_value".to_string(), path.clone(), 0)
            .await
            .unwrap();
        assert!(path.join("device.snap").exists());

        assert!(execute_get_command("test_key".to_string(), path.clone(), 0).await.is_ok());
        assert!(execute_delete_command("test_key".to_string(), path.clone(), 0).await.is_ok());
        assert!(execute_get_command("test_key".to_string(), path.clone(), 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_exist_and_scan_commands() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().to_path_buf();
        execute_init_command(path.clone(), 64, 1, 8).await.unwrap();

        for key in ["key1", "key2", "other"] {
            execute_put_command(key.to_string(), "v".to_string(), path.clone(), 0).await.unwrap();
        }

        let keys = vec!["key1".to_string(), "nope".to_string()];
        assert!(execute_exist_command(keys, path.clone(), 0).await.is_ok());
        assert!(execute_scan_command(0xFFFF_FFFF, 0x6B65_7931, path.clone(), 0).await.is_ok());
        assert!(execute_info_command(path.clone()).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_config_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = execute_get_command("test_key".to_string(), temp_dir.path().to_path_buf(), 0).await;
        assert!(matches!(result, Err(AdapterError::ConfigError(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bench_command_small_run() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().to_path_buf();
        execute_init_command(path.clone(), 64, 1, 8).await.unwrap();

        assert!(execute_bench_command(200, 32, 4, path.clone(), 0).await.is_ok());
        assert!(execute_bench_command(10, 32, 0, path, 0).await.is_err());
    }

    #[test]
    fn test_parse_u32() {
        assert_eq!(parse_u32("0xFF000000"), Ok(0xFF00_0000));
        assert_eq!(parse_u32("42"), Ok(42));
        assert!(parse_u32("0xZZ").is_err());
    }

    #[test]
    fn test_command_parsing() {
        let args = vec!["kvudd", "init", "--path", "/tmp/test", "--queue-depth", "512"];
        assert!(Command::try_parse_from(args).is_ok());

        let args = vec!["kvudd", "put", "key1", "value1", "--path", "/tmp/test", "--container", "3"];
        assert!(Command::try_parse_from(args).is_ok());

        let args = vec!["kvudd", "exist", "--path", "/tmp/test"];
        assert!(Command::try_parse_from(args).is_err());

        let args = vec!["kvudd", "scan", "--bitmask", "0xFF000000", "--pattern", "0x61000000"];
        assert!(Command::try_parse_from(args).is_ok());
    }
}
