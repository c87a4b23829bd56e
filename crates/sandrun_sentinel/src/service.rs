//! The external operation surface of the core: submission, status, logs,
//! output retrieval, health, plus the job table, the retention janitor
//! and coordinated shutdown.
//!
//! Jobs live only in memory and on RAM-backed storage. A finished job
//! stays retrievable for the retention grace period and then vanishes
//! whole: record, logs and work dir.

use crate::queue::{EnqueueOutcome, JobQueue, ShutdownMode, WorkerPool};
use crate::ratelimit::{Admission, RateLimitConfig, RateLimiter};
use sandrun_protocol::{
    FailureReason, HealthReport, JobId, JobManifest, JobStatus, JobStatusReport, RejectReason,
    ResultDescriptor, SubmitError, SubmitOutcome, SystemConfig, WorkerMetadata,
};
use sandrun_security::{job_input_hash, WorkerIdentity};
use sandrun_worker::cancel::CancellationToken;
use sandrun_worker::env_manager::EnvironmentManager;
use sandrun_worker::sandbox::{log_channel, LogFrame, SandboxRuntime};
use sandrun_worker::{workspace, ExecutorDeps, JobExecutor, JobOutcome, PreparedJob, WorkDir};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub system: SystemConfig,
    pub rate: RateLimitConfig,
    pub janitor_tick: Duration,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            rate: RateLimitConfig::default(),
            janitor_tick: Duration::from_secs(5),
        }
    }
}

/// Capped stdout/stderr of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLogs {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub log_truncated: bool,
}

struct JobRecord {
    status: JobStatus,
    job_hash: String,
    source_ip: IpAddr,
    declared_cpu: u64,
    failure: Option<FailureReason>,
    descriptor: Option<ResultDescriptor>,
    worker_metadata: Option<WorkerMetadata>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    log_truncated: bool,
    log_tx: broadcast::Sender<LogFrame>,
    work_dir: Option<WorkDir>,
    completed_at: Option<Instant>,
}

/// Process-wide service facade. The transport holds an `Arc` of this and
/// nothing else.
pub struct SandrunService {
    config: SentinelConfig,
    limiter: RateLimiter,
    queue: Arc<JobQueue>,
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    identity: Option<Arc<WorkerIdentity>>,
}

impl SandrunService {
    fn new(
        config: SentinelConfig,
        queue: Arc<JobQueue>,
        identity: Option<Arc<WorkerIdentity>>,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(config.rate.clone()),
            config,
            queue,
            jobs: Mutex::new(HashMap::new()),
            identity,
        }
    }

    /// Submission operation: admit, hash, enqueue. Rejections never touch
    /// disk; the job hash comes from an in-memory peek at the archive.
    pub fn submit(
        &self,
        source_ip: IpAddr,
        archive: &[u8],
        manifest_bytes: &[u8],
    ) -> Result<SubmitOutcome, SubmitError> {
        let limits = &self.config.system.limits;
        if archive.len() as u64 > limits.max_archive_bytes {
            return Err(SubmitError::Rejected {
                reason: RejectReason::ArchiveTooLarge {
                    limit_bytes: limits.max_archive_bytes,
                },
            });
        }
        let manifest = JobManifest::parse(manifest_bytes).map_err(|e| SubmitError::Rejected {
            reason: RejectReason::MalformedManifest {
                detail: e.to_string(),
            },
        })?;

        let declared_cpu = manifest.clamped(limits).effective_cpu_seconds();
        let entrypoint_bytes =
            workspace::read_archive_entry(archive, &manifest.entrypoint).unwrap_or_default();
        let job_hash = job_input_hash(&manifest, &entrypoint_bytes);

        match self.limiter.try_admit(source_ip, declared_cpu) {
            Admission::Admitted => {}
            Admission::RateLimited {
                reason,
                retry_after_seconds,
            } => {
                return Err(SubmitError::RateLimited {
                    reason,
                    retry_after_seconds,
                })
            }
        }

        let job_id = JobId::new();
        let log_tx = log_channel();
        {
            let mut jobs = self.lock_jobs();
            jobs.insert(
                job_id.clone(),
                JobRecord {
                    status: JobStatus::Queued,
                    job_hash: job_hash.clone(),
                    source_ip,
                    declared_cpu,
                    failure: None,
                    descriptor: None,
                    worker_metadata: None,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    log_truncated: false,
                    log_tx: log_tx.clone(),
                    work_dir: None,
                    completed_at: None,
                },
            );
        }

        let prepared = PreparedJob {
            job_id: job_id.clone(),
            manifest,
            archive: archive.to_vec(),
            job_hash,
            cancel: CancellationToken::new(),
            log_tx,
        };
        if self.queue.enqueue(prepared) == EnqueueOutcome::Rejected {
            // Roll the admission back; the submission never existed.
            self.lock_jobs().remove(&job_id);
            self.limiter.register_end(source_ip, declared_cpu, 0.0);
            return Err(SubmitError::Rejected {
                reason: RejectReason::QueueFull,
            });
        }

        info!(job_id = %job_id, ip = %source_ip, "job accepted");
        Ok(SubmitOutcome {
            job_id,
            status: JobStatus::Queued,
        })
    }

    /// Status query; None once the job has been reaped (or never existed).
    pub fn status(&self, job_id: &JobId) -> Option<JobStatusReport> {
        let jobs = self.lock_jobs();
        let record = jobs.get(job_id)?;
        let descriptor = record.descriptor.as_ref();
        Some(JobStatusReport {
            job_id: job_id.clone(),
            status: record.status,
            job_hash: record.job_hash.clone(),
            exit_code: descriptor.and_then(|d| d.exit_code),
            timed_out: descriptor.map(|d| d.timed_out),
            cpu_seconds: descriptor.map(|d| d.cpu_seconds),
            memory_peak_bytes: descriptor.map(|d| d.memory_peak_bytes),
            failure: record.failure.clone(),
            outputs: descriptor.map(|d| d.outputs.clone()).unwrap_or_default(),
            worker_metadata: record.worker_metadata.clone(),
        })
    }

    pub fn logs(&self, job_id: &JobId) -> Option<JobLogs> {
        let jobs = self.lock_jobs();
        let record = jobs.get(job_id)?;
        Some(JobLogs {
            stdout: record.stdout.clone(),
            stderr: record.stderr.clone(),
            log_truncated: record.log_truncated,
        })
    }

    /// Streaming variant: frames arrive while the job runs, the channel
    /// closes with the job's log sender.
    pub fn subscribe_logs(&self, job_id: &JobId) -> Option<broadcast::Receiver<LogFrame>> {
        let jobs = self.lock_jobs();
        Some(jobs.get(job_id)?.log_tx.subscribe())
    }

    /// Raw bytes of one produced file, or None if it is not in the output
    /// set (inputs and unmatched files are not downloadable).
    ///
    /// File reads happen outside the job-table lock.
    pub fn download(&self, job_id: &JobId, relative_path: &str) -> Option<Vec<u8>> {
        let file_path = {
            let jobs = self.lock_jobs();
            let record = jobs.get(job_id)?;
            let descriptor = record.descriptor.as_ref()?;
            if !descriptor.outputs.contains_key(relative_path) {
                return None;
            }
            record.work_dir.as_ref()?.work_path().join(relative_path)
        };
        std::fs::read(file_path).ok()
    }

    /// All outputs as one tar stream, entries in lexicographic order.
    pub fn download_archive(&self, job_id: &JobId) -> Option<Vec<u8>> {
        let (work_path, paths) = {
            let jobs = self.lock_jobs();
            let record = jobs.get(job_id)?;
            let descriptor = record.descriptor.as_ref()?;
            let work_dir = record.work_dir.as_ref()?;
            (
                work_dir.work_path(),
                descriptor.outputs.keys().cloned().collect::<Vec<_>>(),
            )
        };

        let mut builder = tar::Builder::new(Vec::new());
        for path in &paths {
            let Ok(bytes) = std::fs::read(work_path.join(path)) else {
                continue;
            };
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, bytes.as_slice()).ok()?;
        }
        builder.into_inner().ok()
    }

    /// What pool coordinators probe to discover and authenticate workers.
    pub fn health(&self) -> HealthReport {
        HealthReport::healthy(self.identity.as_ref().map(|i| i.worker_id()))
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.queue_depth()
    }

    pub fn workers_busy(&self) -> usize {
        self.queue.workers_busy()
    }

    /// Destroy records (and work dirs) past the retention grace period.
    pub fn reap_expired(&self) -> usize {
        let grace = self.config.system.retention_grace;
        let mut jobs = self.lock_jobs();
        let before = jobs.len();
        jobs.retain(|job_id, record| {
            let expired = record
                .completed_at
                .map_or(false, |at| at.elapsed() > grace);
            if expired {
                info!(job_id = %job_id, "reaping expired job");
            }
            !expired
        });
        before - jobs.len()
    }

    pub fn gc_rate_limiter(&self) -> usize {
        self.limiter.gc_idle()
    }

    /// Intermediate lifecycle transitions from the executor. A terminal
    /// record means the job lost a race with administrative cancellation;
    /// anything else off the DAG is a bug.
    fn update_status(&self, job_id: &JobId, next: JobStatus) {
        let mut jobs = self.lock_jobs();
        let Some(record) = jobs.get_mut(job_id) else {
            return;
        };
        if record.status == next {
            return;
        }
        if record.status.can_transition_to(next) {
            record.status = next;
        } else if !record.status.is_terminal() {
            panic!(
                "invalid job status transition {} -> {} for {job_id}",
                record.status, next
            );
        }
    }

    /// Apply a worker's outcome: terminal status, logs, descriptor,
    /// accounting. Exactly once per executed job.
    fn finalize(&self, job_id: JobId, outcome: JobOutcome) {
        let (source_ip, declared_cpu) = {
            let mut jobs = self.lock_jobs();
            let Some(record) = jobs.get_mut(&job_id) else {
                warn!(job_id = %job_id, "outcome for unknown job dropped");
                return;
            };
            if record.status.can_transition_to(outcome.status) {
                record.status = outcome.status;
            } else if !record.status.is_terminal() {
                panic!(
                    "invalid terminal transition {} -> {} for {job_id}",
                    record.status, outcome.status
                );
            }
            record.failure = outcome.failure;
            record.descriptor = outcome.descriptor;
            record.worker_metadata = outcome.worker_metadata;
            record.stdout = outcome.stdout;
            record.stderr = outcome.stderr;
            record.log_truncated = outcome.log_truncated;
            record.work_dir = outcome.work_dir;
            record.completed_at = Some(Instant::now());
            (record.source_ip, record.declared_cpu)
        };
        self.limiter
            .register_end(source_ip, declared_cpu, outcome.cpu_seconds);
    }

    /// A job drained from the queue by an abort shutdown: it never ran.
    fn cancel_queued(&self, job: PreparedJob) {
        let mut jobs = self.lock_jobs();
        if let Some(record) = jobs.get_mut(&job.job_id) {
            if record.status.can_transition_to(JobStatus::Cancelled) {
                record.status = JobStatus::Cancelled;
                record.completed_at = Some(Instant::now());
            }
            let (ip, declared) = (record.source_ip, record.declared_cpu);
            drop(jobs);
            self.limiter.register_end(ip, declared, 0.0);
        }
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The assembled core: service facade, worker pool, retention janitor.
pub struct Sentinel {
    service: Arc<SandrunService>,
    pool: Option<WorkerPool>,
    janitor: Option<JoinHandle<()>>,
    janitor_stop: Arc<AtomicBool>,
}

impl Sentinel {
    /// Wire the collaborators together and start the worker pool and
    /// janitor. Collaborators are passed in, not conjured: tests build
    /// their own set and production builds exactly one.
    pub fn start(
        config: SentinelConfig,
        env_manager: Arc<EnvironmentManager>,
        sandbox: Arc<dyn SandboxRuntime>,
        identity: Option<Arc<WorkerIdentity>>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.system.work_root)?;

        let queue = Arc::new(JobQueue::new(config.system.queue_capacity));
        let worker_count = config.system.worker_count;
        let service = Arc::new(SandrunService::new(
            config.clone(),
            queue.clone(),
            identity.clone(),
        ));

        let deps = ExecutorDeps {
            env_manager: env_manager.clone(),
            sandbox,
            identity,
            limits: config.system.limits.clone(),
            work_root: config.system.work_root.clone(),
        };
        let status_service = Arc::downgrade(&service);
        let executor = Arc::new(JobExecutor::new(
            deps,
            Arc::new(move |job_id, status| {
                if let Some(service) = status_service.upgrade() {
                    service.update_status(job_id, status);
                }
            }),
        ));

        let outcome_service = Arc::downgrade(&service);
        let pool = WorkerPool::spawn(
            queue,
            executor,
            worker_count,
            Arc::new(move |job_id, outcome| {
                if let Some(service) = outcome_service.upgrade() {
                    service.finalize(job_id, outcome);
                }
            }),
        );

        let janitor_stop = Arc::new(AtomicBool::new(false));
        let janitor = {
            let stop = janitor_stop.clone();
            let service = service.clone();
            let tick = config.janitor_tick;
            std::thread::Builder::new()
                .name("sandrun-janitor".into())
                .spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        std::thread::sleep(tick);
                        service.reap_expired();
                        service.gc_rate_limiter();
                        env_manager.cleanup_old_environments();
                    }
                })?
        };

        info!(workers = worker_count, "sentinel started");
        Ok(Self {
            service,
            pool: Some(pool),
            janitor: Some(janitor),
            janitor_stop,
        })
    }

    pub fn service(&self) -> Arc<SandrunService> {
        self.service.clone()
    }

    /// Drain: finish queued and running jobs, then stop. Abort: cancel
    /// running jobs through the same path a wall timeout takes, mark the
    /// backlog cancelled, then stop.
    pub fn shutdown(mut self, mode: ShutdownMode) {
        info!(mode = ?mode, "sentinel shutting down");
        let drained = self.service.queue.shutdown(mode);
        for job in drained {
            self.service.cancel_queued(job);
        }
        if let Some(pool) = self.pool.take() {
            pool.join();
        }
        self.janitor_stop.store(true, Ordering::SeqCst);
        if let Some(janitor) = self.janitor.take() {
            let _ = janitor.join();
        }
    }
}

impl Drop for Sentinel {
    fn drop(&mut self) {
        // Belt-and-braces for tests and panic paths; shutdown() already
        // took these when called.
        self.janitor_stop.store(true, Ordering::SeqCst);
        if self.pool.is_some() {
            let drained = self.service.queue.shutdown(ShutdownMode::Abort);
            for job in drained {
                self.service.cancel_queued(job);
            }
            if let Some(pool) = self.pool.take() {
                pool.join();
            }
        }
    }
}
