//! Result descriptor and the externally visible report shapes.

use crate::types::{FailureReason, JobId, JobStatus, OutputSet};
use serde::{Deserialize, Serialize};

/// Canonical record summarizing a finished execution. This is what gets
/// hashed into the signed form; outputs-so-far from failed jobs are included
/// on purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDescriptor {
    pub job_id: JobId,
    pub job_input_hash: String,
    /// None when the child never exited on its own (exec failure, kill)
    pub exit_code: Option<i32>,
    pub cpu_seconds: f64,
    pub memory_peak_bytes: u64,
    pub outputs: OutputSet,
    pub timed_out: bool,
}

impl ResultDescriptor {
    /// Canonical wire form for signing:
    ///
    /// `job_input_hash|exit_code|cpu_seconds|memory_peak_mb|path:hash|…|`
    ///
    /// with a trailing `|` and outputs enumerated in lexicographic key
    /// order. Clients rebuild this string from the JSON fields to verify
    /// the signature, so every piece has a fixed rendering: a missing exit
    /// code is `-1`, CPU seconds carry exactly three decimals, and peak
    /// memory is whole mebibytes.
    pub fn canonical_form(&self) -> String {
        let mut form = format!(
            "{}|{}|{:.3}|{}|",
            self.job_input_hash,
            self.exit_code.unwrap_or(-1),
            self.cpu_seconds,
            self.memory_peak_bytes / (1024 * 1024),
        );
        for (path, meta) in &self.outputs {
            form.push_str(path);
            form.push(':');
            form.push_str(&meta.sha256);
            form.push('|');
        }
        form
    }
}

/// Identity attached to a signed result. Absent entirely in anonymous mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetadata {
    /// Base64 of the worker's 32-byte Ed25519 public key
    pub worker_id: String,
    /// Base64 of the 64-byte signature over `signed_data`
    pub signature: String,
    pub signature_algorithm: String,
    /// The exact canonical form the signature covers
    pub signed_data: String,
}

impl WorkerMetadata {
    pub const ALGORITHM: &'static str = "Ed25519";
}

/// Status-query response. Optional fields are absent until known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub job_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_peak_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default)]
    pub outputs: OutputSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_metadata: Option<WorkerMetadata>,
}

/// Health-probe response; pool coordinators discover workers through this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl HealthReport {
    pub fn healthy(worker_id: Option<String>) -> Self {
        Self {
            status: "healthy".to_string(),
            worker_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileKind, FileMetadata};

    fn meta(hash: &str) -> FileMetadata {
        FileMetadata {
            size_bytes: 2,
            sha256: hash.to_string(),
            kind: FileKind::Text,
            mime: "text/plain".into(),
        }
    }

    #[test]
    fn canonical_form_orders_outputs_and_trails_separator() {
        let mut outputs = OutputSet::new();
        outputs.insert("c.png".into(), meta("cc"));
        outputs.insert("a.png".into(), meta("aa"));
        let descriptor = ResultDescriptor {
            job_id: JobId::new(),
            job_input_hash: "deadbeef".into(),
            exit_code: Some(0),
            cpu_seconds: 1.5,
            memory_peak_bytes: 3 * 1024 * 1024,
            outputs,
            timed_out: false,
        };
        assert_eq!(
            descriptor.canonical_form(),
            "deadbeef|0|1.500|3|a.png:aa|c.png:cc|"
        );
    }

    #[test]
    fn canonical_form_renders_missing_exit_code() {
        let descriptor = ResultDescriptor {
            job_id: JobId::new(),
            job_input_hash: "ff".into(),
            exit_code: None,
            cpu_seconds: 0.0,
            memory_peak_bytes: 0,
            outputs: OutputSet::new(),
            timed_out: true,
        };
        assert_eq!(descriptor.canonical_form(), "ff|-1|0.000|0|");
    }

    #[test]
    fn status_report_omits_unknown_fields() {
        let report = JobStatusReport {
            job_id: JobId::new(),
            status: JobStatus::Queued,
            job_hash: "00".into(),
            exit_code: None,
            timed_out: None,
            cpu_seconds: None,
            memory_peak_bytes: None,
            failure: None,
            outputs: OutputSet::new(),
            worker_metadata: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("exit_code").is_none());
        assert!(json.get("worker_metadata").is_none());
        assert_eq!(json["status"], "queued");
    }

    #[test]
    fn health_report_shape() {
        let json = serde_json::to_value(HealthReport::healthy(None)).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json.get("worker_id").is_none());

        let json = serde_json::to_value(HealthReport::healthy(Some("abc".into()))).unwrap();
        assert_eq!(json["worker_id"], "abc");
    }
}
