//! Job manifest: the submitter-provided configuration for one job.

use crate::config::SystemLimits;
use crate::defaults;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Configuration accepted with a submission. Unknown fields are rejected so
/// a typo'd option fails loudly instead of silently running with defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobManifest {
    /// File inside the work dir to run
    pub entrypoint: String,
    /// Interpreter name, resolved on the sandbox's PATH
    pub interpreter: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Name of a registered environment template; empty = none
    #[serde(default)]
    pub env_template: String,
    /// Glob patterns filtering which produced files are returned; empty = all
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// Hard CPU-time cap; derived from the wall budget when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_seconds: Option<u64>,
    /// Dependency manifest handed to the environment manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,
}

fn default_timeout_seconds() -> u64 {
    defaults::DEFAULT_TIMEOUT_SECONDS
}

fn default_memory_mb() -> u64 {
    defaults::DEFAULT_MEMORY_MB
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("entrypoint must be a relative path inside the work dir: {0}")]
    EntrypointEscapes(String),
    #[error("entrypoint must not be empty")]
    EmptyEntrypoint,
    #[error("interpreter must not be empty")]
    EmptyInterpreter,
}

impl JobManifest {
    /// Parse and validate a manifest from submission bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: JobManifest = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.entrypoint.is_empty() {
            return Err(ManifestError::EmptyEntrypoint);
        }
        if self.interpreter.is_empty() {
            return Err(ManifestError::EmptyInterpreter);
        }
        if !is_safe_relative(&self.entrypoint) {
            return Err(ManifestError::EntrypointEscapes(self.entrypoint.clone()));
        }
        Ok(())
    }

    /// Apply system maxima. Excessive limits are clamped with a warning, not
    /// rejected.
    pub fn clamped(&self, limits: &SystemLimits) -> JobManifest {
        let mut m = self.clone();
        if m.memory_mb > limits.max_memory_mb {
            warn!(
                requested = m.memory_mb,
                max = limits.max_memory_mb,
                "clamping memory_mb"
            );
            m.memory_mb = limits.max_memory_mb;
        }
        if m.timeout_seconds > limits.max_timeout_seconds {
            warn!(
                requested = m.timeout_seconds,
                max = limits.max_timeout_seconds,
                "clamping timeout_seconds"
            );
            m.timeout_seconds = limits.max_timeout_seconds;
        }
        if let Some(cpu) = m.cpu_seconds {
            if cpu > limits.max_cpu_seconds {
                warn!(requested = cpu, max = limits.max_cpu_seconds, "clamping cpu_seconds");
                m.cpu_seconds = Some(limits.max_cpu_seconds);
            }
        }
        m
    }

    /// CPU-time cap actually enforced: the declared value, or half the wall
    /// budget (rounded up) when the manifest left it out.
    pub fn effective_cpu_seconds(&self) -> u64 {
        self.cpu_seconds
            .unwrap_or_else(|| self.timeout_seconds.div_ceil(2).max(1))
    }
}

/// True for relative paths that stay inside the directory they are resolved
/// against: no leading separator, no `..` component.
fn is_safe_relative(path: &str) -> bool {
    if path.starts_with('/') || path.starts_with('\\') {
        return false;
    }
    !path.split('/').any(|c| c == "..")
}
