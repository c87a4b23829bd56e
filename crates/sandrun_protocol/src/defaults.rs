//! Canonical default values shared across the execution core.

use std::time::Duration;

/// Byte separating fields in the canonical job-input encoding.
/// ASCII Unit Separator: outside ordinary path and argument content.
pub const FIELD_SEPARATOR: u8 = 0x1F;

/// Wall-clock limit applied when the manifest omits `timeout_seconds`.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// Memory cap applied when the manifest omits `memory_mb`.
pub const DEFAULT_MEMORY_MB: u64 = 512;

/// Per-stream cap on captured stdout/stderr bytes.
pub const DEFAULT_LOG_CAP_BYTES: usize = 10 * 1024 * 1024;

/// Hard ceiling on processes inside one sandbox (fork-bomb guard).
pub const DEFAULT_MAX_PROCESSES: u32 = 32;

/// Largest accepted submission archive.
pub const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 64 * 1024 * 1024;

/// Largest unpacked size an archive may expand to.
pub const DEFAULT_MAX_UNPACKED_BYTES: u64 = 256 * 1024 * 1024;

pub const DEFAULT_MAX_MEMORY_MB: u64 = 2048;
pub const DEFAULT_MAX_TIMEOUT_SECONDS: u64 = 900;
pub const DEFAULT_MAX_CPU_SECONDS: u64 = 600;

/// How long finished jobs stay retrievable before their work dirs vanish.
pub const DEFAULT_RETENTION_GRACE: Duration = Duration::from_secs(300);

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_WORKER_COUNT: usize = 4;

pub const DEFAULT_WORK_ROOT: &str = "/tmp/sandrun_jobs";
pub const DEFAULT_ENV_CACHE_ROOT: &str = "/tmp/sandrun_envs";
