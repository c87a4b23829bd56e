//! Sandbox executor: isolated supervision of a single child process.
//!
//! The rest of the core depends only on the [`SandboxRuntime`] capability
//! set, never on which variant is behind it:
//!
//! - [`native::NativeSandbox`]: Linux namespaces, seccomp, rlimits
//! - [`fake::FakeSandbox`]: in-process, no real isolation, unit tests only
//! - [`stub::StubSandbox`]: refuses to run (unsupported platforms)

pub mod fake;
#[cfg(target_os = "linux")]
pub mod native;
#[cfg(target_os = "linux")]
mod seccomp;
pub mod stub;

use crate::cancel::CancellationToken;
use sandrun_protocol::FailureReason;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// How long a terminated child gets between SIGTERM and SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SandboxError {
    /// Namespace/mount/pipe/fork setup failed before the child ran.
    /// Surfaces in the job record as `failed{setup}`; no run is counted.
    #[error("sandbox setup failed: {0}")]
    Setup(String),
    #[error("sandboxed execution is not supported on this platform: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Network reachability of the sandboxed child. Either way there is no
/// route to the outside; the network namespace has no uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkPolicy {
    /// No interfaces at all
    #[default]
    Isolated,
    /// 127.0.0.1 only, for jobs that talk to themselves
    LoopbackOnly,
}

/// Resource limits enforced on one execution.
#[derive(Debug, Clone)]
pub struct ExecLimits {
    pub wall: Duration,
    pub cpu_seconds: u64,
    pub memory_bytes: u64,
    pub max_processes: u32,
    /// Per-stream stdout/stderr capture cap
    pub max_output_bytes: usize,
}

/// Everything the sandbox needs to run one command.
#[derive(Debug)]
pub struct ExecSpec {
    /// Job root: control files land here, `work/` is the writable surface
    pub job_root: PathBuf,
    /// Current directory of the child; the only writable mount
    pub work_dir: PathBuf,
    /// Read-only environment clone grafted in under the job root, if any
    pub env_root: Option<PathBuf>,
    /// argv: interpreter first, resolved on the sandbox PATH
    pub command: Vec<String>,
    pub limits: ExecLimits,
    pub network: NetworkPolicy,
    pub gpu_enabled: bool,
    pub cancel: CancellationToken,
    /// Attached streaming subscribers, if any
    pub log_tx: Option<broadcast::Sender<LogFrame>>,
}

/// What the supervisor observed once the child was gone.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// None when the child never exited on its own
    pub exit_code: Option<i32>,
    /// None means a clean exit: `completed`, whatever the exit code
    pub failure: Option<FailureReason>,
    /// From the authoritative rusage counters, not self-reported
    pub cpu_seconds: f64,
    pub memory_peak_bytes: u64,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub log_truncated: bool,
}

/// The capability set the rest of the core is polymorphic over.
pub trait SandboxRuntime: Send + Sync {
    fn run(&self, spec: ExecSpec) -> Result<ExecOutcome, SandboxError>;
}

/// Which stream a log frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One increment of child output, multicast to streaming subscribers.
/// The channel is bounded with overflow-drop: a slow subscriber loses
/// frames rather than stalling the supervisor.
#[derive(Debug, Clone)]
pub struct LogFrame {
    pub stream: LogStream,
    pub bytes: Vec<u8>,
}

/// Capacity of the per-job log fan-out channel, in frames.
pub const LOG_CHANNEL_CAPACITY: usize = 256;

pub fn log_channel() -> broadcast::Sender<LogFrame> {
    broadcast::channel(LOG_CHANNEL_CAPACITY).0
}

/// Capped append shared by all runtimes: copies at most the remaining
/// budget, flags truncation, and multicasts the original frame.
pub(crate) fn append_capped(
    buffer: &mut Vec<u8>,
    chunk: &[u8],
    cap: usize,
    truncated: &mut bool,
    stream: LogStream,
    log_tx: &Option<broadcast::Sender<LogFrame>>,
) {
    if let Some(tx) = log_tx {
        let _ = tx.send(LogFrame {
            stream,
            bytes: chunk.to_vec(),
        });
    }
    if buffer.len() >= cap {
        *truncated = true;
        return;
    }
    let remaining = cap - buffer.len();
    if chunk.len() > remaining {
        buffer.extend_from_slice(&chunk[..remaining]);
        *truncated = true;
    } else {
        buffer.extend_from_slice(chunk);
    }
}
