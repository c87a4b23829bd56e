//! Sandrun protocol: the canonical data model shared across the execution core.
//!
//! Everything wire-shaped lives here so the transport, the sentinel and the
//! worker agree on one definition: job identity and lifecycle, the job
//! manifest, per-file output metadata, the result descriptor and its
//! canonical signed form, and the failure taxonomies.

pub mod config;
pub mod defaults;
pub mod descriptor;
pub mod manifest;
pub mod types;

pub use config::{SystemConfig, SystemLimits};
pub use descriptor::{HealthReport, JobStatusReport, ResultDescriptor, WorkerMetadata};
pub use manifest::{JobManifest, ManifestError};
pub use types::{
    FailureReason, FileKind, FileMetadata, JobId, JobStatus, OutputSet, RejectReason,
    SubmitError, SubmitOutcome,
};
