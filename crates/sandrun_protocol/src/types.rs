//! Core protocol types: job identity, lifecycle, output metadata, failure
//! taxonomies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Job identity
// ============================================================================

/// Canonical job identifier: opaque, globally unique, UUIDv4-backed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(value: &str) -> Result<Self, JobIdError> {
        Uuid::parse_str(value).map_err(|e| JobIdError::Parse(format!("{value}: {e}")))?;
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = JobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobIdError {
    #[error("invalid job id: {0}")]
    Parse(String),
}

// ============================================================================
// Job lifecycle
// ============================================================================

/// Lifecycle of a job. Advances monotonically through a DAG rooted at
/// `Queued` and terminating at one of the four terminal states; there is no
/// resurrection from a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted and waiting for a worker
    #[default]
    Queued,
    /// Worker claimed the job; staging files and building the environment
    Preparing,
    /// Child process is executing inside the sandbox
    Running,
    /// Child exited on its own (any exit code)
    Completed,
    /// The sandbox or setup intervened; see the failure reason
    Failed,
    /// Shut down before completion
    Cancelled,
    /// Wall-clock limit expired
    TimedOut,
}

impl JobStatus {
    pub const ALL: &'static [JobStatus] = &[
        JobStatus::Queued,
        JobStatus::Preparing,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Preparing => "preparing",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::TimedOut
        )
    }

    /// The lifecycle DAG. Terminal states admit no successor.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => matches!(
                next,
                JobStatus::Preparing | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Preparing => matches!(
                next,
                JobStatus::Running | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Running => matches!(
                next,
                JobStatus::Completed
                    | JobStatus::Failed
                    | JobStatus::Cancelled
                    | JobStatus::TimedOut
            ),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Output metadata
// ============================================================================

/// Coarse file classification, by extension, case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Model,
    Video,
    Audio,
    Data,
    Text,
    Archive,
    Code,
    Document,
    #[default]
    Other,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Image => "image",
            FileKind::Model => "model",
            FileKind::Video => "video",
            FileKind::Audio => "audio",
            FileKind::Data => "data",
            FileKind::Text => "text",
            FileKind::Archive => "archive",
            FileKind::Code => "code",
            FileKind::Document => "document",
            FileKind::Other => "other",
        }
    }
}

/// Per-file metadata in a result. An empty `sha256` means the file existed
/// but could not be read when the output set was computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size_bytes: u64,
    pub sha256: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub mime: String,
}

/// Filtered map of POSIX-relative path to per-file metadata.
///
/// A `BTreeMap` on purpose: iteration order is the lexicographic order of
/// the keys, and that determinism is part of the signed contract.
pub type OutputSet = BTreeMap<String, FileMetadata>;

// ============================================================================
// Failure taxonomy
// ============================================================================

/// Why a job ended in `Failed` (or `TimedOut`). Structured so clients can
/// branch on `kind` without parsing prose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Namespace/mount/staging/environment setup failed before the child ran
    Setup { detail: String },
    /// The entrypoint could not be executed
    Exec { detail: String },
    /// The memory cap was breached and the kernel killed the child
    Oom,
    /// The CPU-time cap was breached
    CpuExceeded,
    /// The supervisor's wall-clock timer expired
    TimedOut,
    /// The syscall filter killed the child. `nr` is the offending syscall
    /// number from the filter's notification listener; -1 only on kernels
    /// too old to report one.
    BlockedSyscall { nr: i64 },
    /// Killed by an unclassified signal
    Signal { signal: i32 },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Setup { detail } => write!(f, "setup failed: {detail}"),
            FailureReason::Exec { detail } => write!(f, "exec failed: {detail}"),
            FailureReason::Oom => write!(f, "out of memory"),
            FailureReason::CpuExceeded => write!(f, "cpu time limit exceeded"),
            FailureReason::TimedOut => write!(f, "wall clock limit exceeded"),
            FailureReason::BlockedSyscall { nr } => write!(f, "blocked syscall: {nr}"),
            FailureReason::Signal { signal } => write!(f, "killed by signal {signal}"),
        }
    }
}

// ============================================================================
// Admission
// ============================================================================

/// Why a submission was turned away before a job existed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Admitting the declared CPU seconds would exceed the per-IP window budget
    CpuBudget,
    /// The per-IP concurrent-job cap is full
    ConcurrencyCap,
    /// The per-IP hourly submission cap is full
    HourlyCap,
    /// The dispatch queue is at capacity
    QueueFull,
    MalformedManifest { detail: String },
    ArchiveTooLarge { limit_bytes: u64 },
}

/// Accepted submission: the id to poll and the status it started in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Submission error, split so transports can map rate limiting to a
/// retryable signal and the rest to a terminal rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum SubmitError {
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        #[serde(flatten)]
        reason: RejectReason,
        retry_after_seconds: u64,
    },
    #[error("rejected")]
    Rejected {
        #[serde(flatten)]
        reason: RejectReason,
    },
}
