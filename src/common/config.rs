use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::exception::BlkError;

/** Symlink targets whose basename starts with this prefix are served by the user-space NVMe backend. */
pub const SPDK_PREFIX: &str = "spdk:";

/** Backend names accepted by the block device factory. */
pub const BDEV_TYPE_AIO: &str = "aio";
pub const BDEV_TYPE_SPDK: &str = "spdk";

pub const DEFAULT_BLOCK_SIZE: u64 = 4096;
pub const DEFAULT_PAGE_SIZE: usize = 4096;

// Request splitting
pub const DEFAULT_CHUNK_SIZE: u64 = 128 * 1024; // 128KB per hardware command

// DMA staging buffers owned by each submission queue
pub const DATA_BUFFER_SIZE: usize = 8192;
pub const DATA_BUFFER_DEFAULT_NUM: usize = 1024;

// Controller tuning applied on probe
pub const NVME_NUM_IO_QUEUES: u32 = 96;
pub const NVME_CTRLR_KEEP_ALIVE_TIMEOUT_MS: u32 = 10_000; // arbitrary, matches common driver defaults

// Completion polling
pub const DEFAULT_IO_SLEEP_US: u64 = 5;

// Kernel AIO
pub const DEFAULT_AIO_THREADS: usize = 4;
pub const DEFAULT_AIO_MAX_QUEUE_DEPTH: usize = 1024;
pub const DEFAULT_AIO_REAP_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_AIO_REAP_MAX: usize = 16;

/// Stack size for the driver manager worker and reaper threads.
pub const WORKER_STACK_SIZE: usize = 2 * 1024 * 1024;

/// How the kernel backend issues asynchronous I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AioEngine {
    /// io_uring when the kernel allows it, the thread pool otherwise.
    #[default]
    Auto,
    /// io_uring only; opening fails without it.
    Uring,
    /// Positional I/O on a pool of `aio_threads` threads.
    Threads,
}

pub type DeviceId = u64;
pub type CommandId = u16;

/// Runtime configuration injected at open time.
///
/// Every field has a default, so a config file only needs to name what it overrides:
///
/// ```toml
/// bdev_type = "spdk"
/// chunk_size = 65536
/// max_queue_depth = 64
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlkConfig {
    /// `""` probes the path, otherwise `"aio"` or `"spdk"`.
    pub bdev_type: String,

    // Kernel device
    pub block_size: u64,
    pub direct_io: bool,
    pub aio_engine: AioEngine,
    pub aio_threads: usize,
    pub aio_max_queue_depth: usize,
    pub aio_reap_timeout_ms: u64,
    pub aio_reap_max: usize,

    // User-space NVMe environment
    pub spdk_coremask: String,
    pub spdk_mem_mb: u32,
    pub num_io_queues: u32,
    pub keep_alive_timeout_ms: u32,

    // Submission
    pub chunk_size: u64,
    pub max_queue_depth: Option<u32>,
    pub io_sleep_us: u64,
    pub max_io_completions: u32,
    pub data_buffer_size: usize,
    pub data_buffer_num: usize,
}

impl Default for BlkConfig {
    fn default() -> Self {
        Self {
            bdev_type: String::new(),

            block_size: DEFAULT_BLOCK_SIZE,
            direct_io: true,
            aio_engine: AioEngine::Auto,
            aio_threads: DEFAULT_AIO_THREADS,
            aio_max_queue_depth: DEFAULT_AIO_MAX_QUEUE_DEPTH,
            aio_reap_timeout_ms: DEFAULT_AIO_REAP_TIMEOUT_MS,
            aio_reap_max: DEFAULT_AIO_REAP_MAX,

            spdk_coremask: "0x1".to_string(),
            spdk_mem_mb: 512,
            num_io_queues: NVME_NUM_IO_QUEUES,
            keep_alive_timeout_ms: NVME_CTRLR_KEEP_ALIVE_TIMEOUT_MS,

            chunk_size: DEFAULT_CHUNK_SIZE,
            max_queue_depth: None,
            io_sleep_us: DEFAULT_IO_SLEEP_US,
            max_io_completions: 0, // 0 lets the queue pair decide
            data_buffer_size: DATA_BUFFER_SIZE,
            data_buffer_num: DATA_BUFFER_DEFAULT_NUM,
        }
    }
}

impl BlkConfig {
    pub fn load(path: &Path) -> Result<Self, BlkError> {
        let contents = fs::read_to_string(path)?;
        let config: BlkConfig = toml::from_str(&contents)
            .map_err(|e| BlkError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BlkError> {
        if !self.block_size.is_power_of_two() {
            return Err(BlkError::InvalidConfig(format!(
                "block_size {} is not a power of two",
                self.block_size
            )));
        }
        if self.chunk_size == 0 || self.data_buffer_size == 0 {
            return Err(BlkError::InvalidConfig(
                "chunk_size and data_buffer_size must be non-zero".to_string(),
            ));
        }
        // A single chunk must always fit in an idle pool, otherwise the drain loop never progresses.
        let pool_bytes = self.data_buffer_size as u64 * self.data_buffer_num as u64;
        if pool_bytes < self.chunk_size {
            return Err(BlkError::InvalidConfig(format!(
                "data buffer pool ({} x {}) cannot hold one {} byte chunk",
                self.data_buffer_num, self.data_buffer_size, self.chunk_size
            )));
        }
        if self.aio_threads == 0 || self.aio_max_queue_depth == 0 {
            return Err(BlkError::InvalidConfig(
                "aio_threads and aio_max_queue_depth must be non-zero".to_string(),
            ));
        }
        if self.max_queue_depth == Some(0) {
            return Err(BlkError::InvalidConfig("max_queue_depth must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn io_sleep(&self) -> Duration {
        Duration::from_micros(self.io_sleep_us)
    }

    pub fn aio_reap_timeout(&self) -> Duration {
        Duration::from_millis(self.aio_reap_timeout_ms)
    }
}
