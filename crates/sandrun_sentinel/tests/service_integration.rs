//! Full-cycle tests over the assembled sentinel with the fake runtime:
//! submit → dispatch → execute → retrieve → reap, plus admission and
//! shutdown behavior.

use flate2::write::GzEncoder;
use flate2::Compression;
use sandrun_protocol::{
    JobStatus, RejectReason, SubmitError, SystemConfig, SystemLimits,
};
use sandrun_security::hashing::sha256_hex;
use sandrun_security::{verify, WorkerIdentity};
use sandrun_sentinel::{
    RateLimitConfig, SandrunService, Sentinel, SentinelConfig, ShutdownMode,
};
use sandrun_worker::sandbox::fake::FakeSandbox;
use sandrun_worker::EnvironmentManager;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn manifest_bytes(entrypoint: &str, extra: serde_json::Value) -> Vec<u8> {
    let mut manifest = serde_json::json!({
        "entrypoint": entrypoint,
        "interpreter": "sh",
        "timeout_seconds": 10,
    });
    if let (Some(m), Some(e)) = (manifest.as_object_mut(), extra.as_object()) {
        for (k, v) in e {
            m.insert(k.clone(), v.clone());
        }
    }
    serde_json::to_vec(&manifest).unwrap()
}

fn config_for(root: &Path, workers: usize) -> SentinelConfig {
    SentinelConfig {
        system: SystemConfig {
            work_root: root.join("jobs"),
            env_cache_root: root.join("envs"),
            queue_capacity: 16,
            worker_count: workers,
            retention_grace: Duration::from_secs(300),
            limits: SystemLimits::default(),
        },
        rate: RateLimitConfig::default(),
        janitor_tick: Duration::from_millis(100),
    }
}

fn start(config: SentinelConfig, identity: Option<Arc<WorkerIdentity>>) -> Sentinel {
    let env_manager =
        Arc::new(EnvironmentManager::new(config.system.env_cache_root.clone()).unwrap());
    Sentinel::start(config, env_manager, Arc::new(FakeSandbox), identity).unwrap()
}

fn ip(last: u8) -> IpAddr {
    IpAddr::from([127, 0, 0, last])
}

fn wait_terminal(
    service: &Arc<SandrunService>,
    job_id: &sandrun_protocol::JobId,
) -> sandrun_protocol::JobStatusReport {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let report = service.status(job_id).expect("job still known");
        if report.status.is_terminal() {
            return report;
        }
        assert!(Instant::now() < deadline, "job never reached a terminal state");
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn submit_execute_retrieve_reap() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(dir.path(), 2);
    config.system.retention_grace = Duration::from_millis(800);
    let sentinel = start(config, None);
    let service = sentinel.service();

    let outcome = service
        .submit(
            ip(1),
            &archive(&[("main.sh", b"echo hi; printf ok > result.txt".as_slice())]),
            &manifest_bytes("main.sh", serde_json::json!({})),
        )
        .unwrap();
    assert_eq!(outcome.status, JobStatus::Queued);

    let report = wait_terminal(&service, &outcome.job_id);
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(report.job_hash.len(), 64);
    assert_eq!(report.outputs["result.txt"].sha256, sha256_hex(b"ok"));
    assert!(report.worker_metadata.is_none());

    let logs = service.logs(&outcome.job_id).unwrap();
    assert_eq!(logs.stdout, b"hi\n");
    assert!(!logs.log_truncated);

    assert_eq!(
        service.download(&outcome.job_id, "result.txt").unwrap(),
        b"ok"
    );
    assert!(service.download(&outcome.job_id, "main.sh").is_none());
    let bundle = service.download_archive(&outcome.job_id).unwrap();
    assert!(!bundle.is_empty());

    // After the grace period the job vanishes whole.
    let deadline = Instant::now() + Duration::from_secs(5);
    while service.status(&outcome.job_id).is_some() {
        assert!(Instant::now() < deadline, "job never reaped");
        std::thread::sleep(Duration::from_millis(50));
    }

    sentinel.shutdown(ShutdownMode::Drain);
}

#[test]
fn signed_results_verify_publicly() {
    let dir = tempfile::tempdir().unwrap();
    let identity = Arc::new(WorkerIdentity::generate());
    let worker_id = identity.worker_id();
    let sentinel = start(config_for(dir.path(), 1), Some(identity));
    let service = sentinel.service();

    assert_eq!(service.health().worker_id.as_deref(), Some(worker_id.as_str()));

    let outcome = service
        .submit(
            ip(1),
            &archive(&[("main.sh", b"printf data > out.txt".as_slice())]),
            &manifest_bytes("main.sh", serde_json::json!({})),
        )
        .unwrap();
    let report = wait_terminal(&service, &outcome.job_id);
    let metadata = report.worker_metadata.unwrap();
    assert_eq!(metadata.worker_id, worker_id);
    assert!(verify(
        metadata.signed_data.as_bytes(),
        &metadata.signature,
        &metadata.worker_id
    ));
    // Tampering with the canonical form breaks verification.
    let tampered = metadata.signed_data.replace("out.txt", "out2.txt");
    assert!(!verify(
        tampered.as_bytes(),
        &metadata.signature,
        &metadata.worker_id
    ));

    sentinel.shutdown(ShutdownMode::Drain);
}

#[test]
fn anonymous_health_has_no_worker_id() {
    let dir = tempfile::tempdir().unwrap();
    let sentinel = start(config_for(dir.path(), 0), None);
    let health = sentinel.service().health();
    assert_eq!(health.status, "healthy");
    assert!(health.worker_id.is_none());
    sentinel.shutdown(ShutdownMode::Abort);
}

#[test]
fn cpu_budget_rejects_the_third_submission() {
    let dir = tempfile::tempdir().unwrap();
    // No workers: reservations stay active for the whole test.
    let sentinel = start(config_for(dir.path(), 0), None);
    let service = sentinel.service();
    let body = archive(&[("main.sh", b"echo hi".as_slice())]);
    let manifest = manifest_bytes("main.sh", serde_json::json!({"cpu_seconds": 4}));

    service.submit(ip(7), &body, &manifest).unwrap();
    service.submit(ip(7), &body, &manifest).unwrap();
    match service.submit(ip(7), &body, &manifest) {
        Err(SubmitError::RateLimited { reason, retry_after_seconds }) => {
            assert_eq!(reason, RejectReason::CpuBudget);
            assert!(retry_after_seconds > 0);
        }
        other => panic!("expected rate limiting, got {other:?}"),
    }
    // Another IP is unaffected.
    service.submit(ip(8), &body, &manifest).unwrap();

    sentinel.shutdown(ShutdownMode::Abort);
}

#[test]
fn queue_backpressure_rejects_and_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(dir.path(), 0);
    config.system.queue_capacity = 1;
    config.rate.window_cpu_budget = 1000.0;
    config.rate.per_ip_concurrency = 100;
    let sentinel = start(config, None);
    let service = sentinel.service();
    let body = archive(&[("main.sh", b"echo hi".as_slice())]);
    let manifest = manifest_bytes("main.sh", serde_json::json!({"cpu_seconds": 1}));

    service.submit(ip(1), &body, &manifest).unwrap();
    assert_eq!(service.queue_depth(), 1);
    match service.submit(ip(1), &body, &manifest) {
        Err(SubmitError::Rejected { reason }) => assert_eq!(reason, RejectReason::QueueFull),
        other => panic!("expected queue_full, got {other:?}"),
    }

    sentinel.shutdown(ShutdownMode::Abort);
}

#[test]
fn malformed_manifest_and_oversized_archive_reject() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(dir.path(), 0);
    config.system.limits.max_archive_bytes = 64;
    let sentinel = start(config, None);
    let service = sentinel.service();

    match service.submit(ip(1), &archive(&[]), b"{not json") {
        Err(SubmitError::Rejected {
            reason: RejectReason::MalformedManifest { .. },
        }) => {}
        other => panic!("expected malformed_manifest, got {other:?}"),
    }

    let big = vec![0u8; 4096];
    let body = archive(&[("big.bin", big.as_slice())]);
    match service.submit(ip(1), &body, &manifest_bytes("main.sh", serde_json::json!({}))) {
        Err(SubmitError::Rejected {
            reason: RejectReason::ArchiveTooLarge { .. },
        }) => {}
        other => panic!("expected archive_too_large, got {other:?}"),
    }

    sentinel.shutdown(ShutdownMode::Abort);
}

#[test]
fn drain_shutdown_finishes_inflight_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let sentinel = start(config_for(dir.path(), 1), None);
    let service = sentinel.service();

    let outcome = service
        .submit(
            ip(1),
            &archive(&[("main.sh", b"sleep 1; echo done".as_slice())]),
            &manifest_bytes("main.sh", serde_json::json!({})),
        )
        .unwrap();

    // Give the worker a moment to pick it up, then drain.
    std::thread::sleep(Duration::from_millis(200));
    sentinel.shutdown(ShutdownMode::Drain);

    let report = service.status(&outcome.job_id).unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(service.logs(&outcome.job_id).unwrap().stdout, b"done\n");
}

#[test]
fn abort_shutdown_cancels_running_and_queued() {
    let dir = tempfile::tempdir().unwrap();
    let sentinel = start(config_for(dir.path(), 1), None);
    let service = sentinel.service();
    let slow = archive(&[("main.sh", b"sleep 30".as_slice())]);

    let running = service
        .submit(ip(1), &slow, &manifest_bytes("main.sh", serde_json::json!({})))
        .unwrap();
    let queued = service
        .submit(ip(2), &slow, &manifest_bytes("main.sh", serde_json::json!({})))
        .unwrap();

    // Let the single worker claim the first job.
    std::thread::sleep(Duration::from_millis(300));
    let started = Instant::now();
    sentinel.shutdown(ShutdownMode::Abort);
    assert!(started.elapsed() < Duration::from_secs(10), "abort did not cut the sleep short");

    let running_status = service.status(&running.job_id).unwrap().status;
    assert_eq!(running_status, JobStatus::Cancelled);
    assert_eq!(
        service.status(&queued.job_id).unwrap().status,
        JobStatus::Cancelled
    );
}
