//! Job executor: owns one job's lifecycle from admitted submission to
//! terminal outcome.
//!
//! Admission (rate limiting, queueing) happens before a job reaches this
//! module; staging, environment, sandbox, hashing and signing happen
//! here, and every path out leaves no stray state: the
//! work dir travels out in the outcome for the retrieval grace period and
//! is destroyed by its guard after that.

use crate::cancel::CancellationToken;
use crate::env_manager::{EnvError, EnvironmentManager};
use crate::sandbox::{
    ExecLimits, ExecOutcome, ExecSpec, LogFrame, NetworkPolicy, SandboxError, SandboxRuntime,
};
use crate::workspace::{self, WorkDir};
use sandrun_protocol::{
    FailureReason, JobId, JobManifest, JobStatus, OutputSet, ResultDescriptor, SystemLimits,
    WorkerMetadata,
};
use sandrun_security::hashing;
use sandrun_security::WorkerIdentity;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Collaborators the executor runs against. Explicit objects, not ambient
/// globals: tests construct their own set.
pub struct ExecutorDeps {
    pub env_manager: Arc<EnvironmentManager>,
    pub sandbox: Arc<dyn SandboxRuntime>,
    pub identity: Option<Arc<WorkerIdentity>>,
    pub limits: SystemLimits,
    /// RAM-backed root for per-job work dirs
    pub work_root: PathBuf,
}

/// Observer for intermediate lifecycle transitions (queued → preparing →
/// running); the caller applies the terminal one from the outcome.
pub type StatusHook = Arc<dyn Fn(&JobId, JobStatus) + Send + Sync>;

/// An admitted job as handed over by the dispatcher.
pub struct PreparedJob {
    pub job_id: JobId,
    pub manifest: JobManifest,
    pub archive: Vec<u8>,
    pub job_hash: String,
    pub cancel: CancellationToken,
    pub log_tx: broadcast::Sender<LogFrame>,
}

/// Everything the job table needs to finalize a job.
pub struct JobOutcome {
    pub status: JobStatus,
    pub failure: Option<FailureReason>,
    pub descriptor: Option<ResultDescriptor>,
    pub worker_metadata: Option<WorkerMetadata>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub log_truncated: bool,
    pub cpu_seconds: f64,
    /// Kept alive for the retrieval grace period, then dropped
    pub work_dir: Option<WorkDir>,
}

pub struct JobExecutor {
    deps: ExecutorDeps,
    on_status: StatusHook,
}

impl JobExecutor {
    pub fn new(deps: ExecutorDeps, on_status: StatusHook) -> Self {
        Self { deps, on_status }
    }

    pub fn execute(&self, job: PreparedJob) -> JobOutcome {
        (self.on_status)(&job.job_id, JobStatus::Preparing);
        let manifest = job.manifest.clamped(&self.deps.limits);

        let work_dir = match workspace::stage_archive(
            &self.deps.work_root,
            &job.job_id,
            &job.archive,
            self.deps.limits.max_unpacked_bytes,
        ) {
            Ok(work_dir) => work_dir,
            Err(e) => return self.setup_failure(&job, format!("stage: {e}"), None),
        };

        // The environment lease outlives the sandbox run and releases the
        // cache entry (and the clone) when this function returns.
        let env_lease = if manifest.env_template.is_empty() {
            if manifest.requirements.is_some() {
                return self.setup_failure(
                    &job,
                    "requirements need an env_template to install into".to_string(),
                    Some(work_dir),
                );
            }
            None
        } else {
            match self
                .deps
                .env_manager
                .prepare_environment(&manifest.env_template, &job.job_id)
            {
                Ok(lease) => Some(lease),
                Err(e @ (EnvError::TemplateNotFound(_) | EnvError::BuildFailed(_))) => {
                    return self.setup_failure(&job, e.to_string(), Some(work_dir));
                }
                Err(EnvError::Io(e)) => {
                    return self.setup_failure(&job, format!("environment: {e}"), Some(work_dir));
                }
            }
        };

        if let (Some(lease), Some(requirements)) = (&env_lease, &manifest.requirements) {
            let path = work_dir.work_path().join(requirements);
            if let Err(e) = self.deps.env_manager.install_requirements(lease, &path) {
                return self.setup_failure(&job, e.to_string(), Some(work_dir));
            }
        }

        if !work_dir.work_path().join(&manifest.entrypoint).is_file() {
            return self.setup_failure(&job, "no_entrypoint".to_string(), Some(work_dir));
        }

        let mut command = Vec::with_capacity(2 + manifest.args.len());
        command.push(manifest.interpreter.clone());
        command.push(manifest.entrypoint.clone());
        command.extend(manifest.args.iter().cloned());

        let spec = ExecSpec {
            job_root: work_dir.job_root().to_path_buf(),
            work_dir: work_dir.work_path(),
            env_root: env_lease.as_ref().map(|l| l.fs_root().to_path_buf()),
            command,
            limits: ExecLimits {
                wall: Duration::from_secs(manifest.timeout_seconds),
                cpu_seconds: manifest.effective_cpu_seconds(),
                memory_bytes: manifest.memory_mb * 1024 * 1024,
                max_processes: self.deps.limits.max_processes,
                max_output_bytes: self.deps.limits.max_output_bytes,
            },
            network: NetworkPolicy::Isolated,
            gpu_enabled: env_lease.as_ref().is_some_and(|l| l.gpu_enabled()),
            cancel: job.cancel.clone(),
            log_tx: Some(job.log_tx.clone()),
        };

        (self.on_status)(&job.job_id, JobStatus::Running);
        let outcome = match self.deps.sandbox.run(spec) {
            Ok(outcome) => outcome,
            Err(SandboxError::Setup(detail)) => {
                return self.setup_failure(&job, detail, Some(work_dir));
            }
            Err(SandboxError::Unsupported(detail)) => {
                return self.setup_failure(&job, detail.to_string(), Some(work_dir));
            }
            Err(SandboxError::Io(e)) => {
                return self.setup_failure(&job, format!("sandbox: {e}"), Some(work_dir));
            }
        };

        self.finalize(&job, &manifest, work_dir, outcome)
    }

    fn finalize(
        &self,
        job: &PreparedJob,
        manifest: &JobManifest,
        work_dir: WorkDir,
        outcome: ExecOutcome,
    ) -> JobOutcome {
        // Outputs are what the job produced: everything in the work dir
        // matching the filter, minus the paths that came in with the
        // archive. Partial outputs from failed runs are included on
        // purpose.
        let mut outputs: OutputSet =
            hashing::hash_directory(&work_dir.work_path(), &manifest.outputs);
        for staged in work_dir.staged_paths() {
            outputs.remove(staged);
        }

        let descriptor = ResultDescriptor {
            job_id: job.job_id.clone(),
            job_input_hash: job.job_hash.clone(),
            exit_code: outcome.exit_code,
            cpu_seconds: outcome.cpu_seconds,
            memory_peak_bytes: outcome.memory_peak_bytes,
            outputs,
            timed_out: outcome.timed_out,
        };

        let worker_metadata = self.deps.identity.as_ref().map(|identity| {
            let signed_data = descriptor.canonical_form();
            WorkerMetadata {
                worker_id: identity.worker_id(),
                signature: identity.sign(signed_data.as_bytes()),
                signature_algorithm: WorkerMetadata::ALGORITHM.to_string(),
                signed_data,
            }
        });

        let status = if outcome.timed_out && job.cancel.is_cancelled() {
            JobStatus::Cancelled
        } else if outcome.timed_out {
            JobStatus::TimedOut
        } else if outcome.failure.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };

        info!(
            job_id = %job.job_id,
            status = %status,
            exit_code = ?outcome.exit_code,
            cpu_seconds = outcome.cpu_seconds,
            outputs = descriptor.outputs.len(),
            "job finished"
        );

        JobOutcome {
            status,
            failure: outcome.failure,
            descriptor: Some(descriptor),
            worker_metadata,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            log_truncated: outcome.log_truncated,
            cpu_seconds: outcome.cpu_seconds,
            work_dir: Some(work_dir),
        }
    }

    fn setup_failure(
        &self,
        job: &PreparedJob,
        detail: String,
        work_dir: Option<WorkDir>,
    ) -> JobOutcome {
        warn!(job_id = %job.job_id, detail = %detail, "job setup failed");
        JobOutcome {
            status: JobStatus::Failed,
            failure: Some(FailureReason::Setup { detail }),
            descriptor: None,
            worker_metadata: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            log_truncated: false,
            cpu_seconds: 0.0,
            work_dir,
        }
    }
}
