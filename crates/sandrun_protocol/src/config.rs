//! System configuration shared by the binary, the sentinel and the worker.

use crate::defaults;
use std::path::PathBuf;
use std::time::Duration;

/// Hard ceilings a manifest is clamped against.
#[derive(Debug, Clone)]
pub struct SystemLimits {
    pub max_memory_mb: u64,
    pub max_timeout_seconds: u64,
    pub max_cpu_seconds: u64,
    pub max_archive_bytes: u64,
    pub max_unpacked_bytes: u64,
    /// Per-stream stdout/stderr capture cap
    pub max_output_bytes: usize,
    pub max_processes: u32,
}

impl Default for SystemLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: defaults::DEFAULT_MAX_MEMORY_MB,
            max_timeout_seconds: defaults::DEFAULT_MAX_TIMEOUT_SECONDS,
            max_cpu_seconds: defaults::DEFAULT_MAX_CPU_SECONDS,
            max_archive_bytes: defaults::DEFAULT_MAX_ARCHIVE_BYTES,
            max_unpacked_bytes: defaults::DEFAULT_MAX_UNPACKED_BYTES,
            max_output_bytes: defaults::DEFAULT_LOG_CAP_BYTES,
            max_processes: defaults::DEFAULT_MAX_PROCESSES,
        }
    }
}

/// Canonical system configuration used by the launcher and the sentinel.
/// Jobs are RAM-only; the two on-disk roots below are the whole persisted
/// surface besides the operator's worker key file.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// RAM-backed root under which per-job work dirs are created
    pub work_root: PathBuf,
    /// Root of the environment cache, sub-keyed by template name
    pub env_cache_root: PathBuf,
    pub queue_capacity: usize,
    pub worker_count: usize,
    /// How long finished jobs stay retrievable
    pub retention_grace: Duration,
    pub limits: SystemLimits,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from(defaults::DEFAULT_WORK_ROOT),
            env_cache_root: PathBuf::from(defaults::DEFAULT_ENV_CACHE_ROOT),
            queue_capacity: defaults::DEFAULT_QUEUE_CAPACITY,
            worker_count: defaults::DEFAULT_WORKER_COUNT,
            retention_grace: defaults::DEFAULT_RETENTION_GRACE,
            limits: SystemLimits::default(),
        }
    }
}
