//! Bounded FIFO dispatch queue and its worker pool.
//!
//! The async transport edge enqueues; a fixed pool of blocking threads
//! drains in submission order and runs the executor. Backpressure is a
//! non-blocking rejection the transport maps to service-unavailable.

use sandrun_protocol::JobId;
use sandrun_worker::cancel::CancellationToken;
use sandrun_worker::{JobExecutor, JobOutcome, PreparedJob};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// Queue at capacity or shutting down; the submitter should retry
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop intake, let queued and running jobs finish
    Drain,
    /// Stop intake, cancel running jobs, discard the backlog
    Abort,
}

struct QueueInner {
    queue: VecDeque<PreparedJob>,
    /// Cancellation handles of jobs currently on a worker
    running: HashMap<JobId, CancellationToken>,
    busy: usize,
    shutdown: Option<ShutdownMode>,
}

pub struct JobQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                running: HashMap::new(),
                busy: 0,
                shutdown: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Non-blocking; admission (rate limiting) has already happened.
    pub fn enqueue(&self, job: PreparedJob) -> EnqueueOutcome {
        let mut inner = self.lock();
        if inner.shutdown.is_some() || inner.queue.len() >= self.capacity {
            return EnqueueOutcome::Rejected;
        }
        debug!(job_id = %job.job_id, depth = inner.queue.len() + 1, "job enqueued");
        inner.queue.push_back(job);
        self.cond.notify_one();
        EnqueueOutcome::Accepted
    }

    pub fn queue_depth(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn workers_busy(&self) -> usize {
        self.lock().busy
    }

    /// Stop intake. Abort additionally cancels running jobs and returns
    /// the backlog so the caller can mark it cancelled.
    pub fn shutdown(&self, mode: ShutdownMode) -> Vec<PreparedJob> {
        let mut inner = self.lock();
        inner.shutdown = Some(mode);
        let drained = match mode {
            ShutdownMode::Drain => Vec::new(),
            ShutdownMode::Abort => {
                for token in inner.running.values() {
                    token.cancel();
                }
                inner.queue.drain(..).collect()
            }
        };
        info!(mode = ?mode, discarded = drained.len(), "queue shutting down");
        self.cond.notify_all();
        drained
    }

    /// Blocks until a job is available. None means the pool should exit:
    /// abort, or drain with an empty backlog.
    fn next_job(&self) -> Option<PreparedJob> {
        let mut inner = self.lock();
        loop {
            match inner.shutdown {
                Some(ShutdownMode::Abort) => return None,
                Some(ShutdownMode::Drain) if inner.queue.is_empty() => return None,
                _ => {}
            }
            if let Some(job) = inner.queue.pop_front() {
                inner.busy += 1;
                inner
                    .running
                    .insert(job.job_id.clone(), job.cancel.clone());
                return Some(job);
            }
            inner = self
                .cond
                .wait(inner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn finish_job(&self, job_id: &JobId) {
        let mut inner = self.lock();
        inner.busy = inner.busy.saturating_sub(1);
        inner.running.remove(job_id);
        self.cond.notify_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fixed-size pool of blocking executor threads draining the queue in
/// FIFO order.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        queue: Arc<JobQueue>,
        executor: Arc<JobExecutor>,
        count: usize,
        on_outcome: Arc<dyn Fn(JobId, JobOutcome) + Send + Sync>,
    ) -> Self {
        let handles = (0..count)
            .map(|index| {
                let queue = queue.clone();
                let executor = executor.clone();
                let on_outcome = on_outcome.clone();
                std::thread::Builder::new()
                    .name(format!("sandrun-worker-{index}"))
                    .spawn(move || {
                        while let Some(job) = queue.next_job() {
                            let job_id = job.job_id.clone();
                            let outcome = executor.execute(job);
                            queue.finish_job(&job_id);
                            on_outcome(job_id, outcome);
                        }
                        debug!(worker = index, "worker exiting");
                    })
                    .expect("worker thread spawns")
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker to exit; call after `JobQueue::shutdown`.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
