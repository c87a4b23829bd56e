//! End-to-end executor tests over the in-process fake runtime.
//!
//! Shell entrypoints keep these hermetic: `sh` is everywhere, interpreters
//! are not.

use flate2::write::GzEncoder;
use flate2::Compression;
use sandrun_protocol::{FailureReason, JobId, JobManifest, JobStatus, SystemLimits};
use sandrun_security::hashing::sha256_hex;
use sandrun_security::{job_input_hash, verify, WorkerIdentity};
use sandrun_worker::sandbox::fake::FakeSandbox;
use sandrun_worker::sandbox::log_channel;
use sandrun_worker::{
    CancellationToken, EnvironmentManager, ExecutorDeps, JobExecutor, JobOutcome, PreparedJob,
};
use std::path::Path;
use std::sync::Arc;

fn build_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
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

fn executor(root: &Path, identity: Option<Arc<WorkerIdentity>>) -> JobExecutor {
    let deps = ExecutorDeps {
        env_manager: Arc::new(EnvironmentManager::new(root.join("envs")).unwrap()),
        sandbox: Arc::new(FakeSandbox),
        identity,
        limits: SystemLimits::default(),
        work_root: root.join("jobs"),
    };
    JobExecutor::new(deps, Arc::new(|_, _| {}))
}

fn manifest(entrypoint: &str, outputs: &[&str]) -> JobManifest {
    let json = serde_json::json!({
        "entrypoint": entrypoint,
        "interpreter": "sh",
        "outputs": outputs,
        "timeout_seconds": 10,
    });
    JobManifest::parse(&serde_json::to_vec(&json).unwrap()).unwrap()
}

fn run(executor: &JobExecutor, manifest: JobManifest, archive: Vec<u8>) -> JobOutcome {
    let entry_bytes = manifest.entrypoint.clone();
    let job_hash = job_input_hash(
        &manifest,
        sandrun_worker::workspace::read_archive_entry(&archive, &entry_bytes)
            .unwrap_or_default()
            .as_slice(),
    );
    executor.execute(PreparedJob {
        job_id: JobId::new(),
        manifest,
        archive,
        job_hash,
        cancel: CancellationToken::new(),
        log_tx: log_channel(),
    })
}

#[test]
fn hello_world_completes_with_stable_hash() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), None);
    let script = b"echo hi\n".as_slice();
    let archive = build_archive(&[("main.sh", script)]);

    let outcome = run(&exec, manifest("main.sh", &[]), archive.clone());
    assert_eq!(outcome.status, JobStatus::Completed);
    let descriptor = outcome.descriptor.as_ref().unwrap();
    assert_eq!(descriptor.exit_code, Some(0));
    assert_eq!(outcome.stdout, b"hi\n");
    // The entrypoint itself is an input, not an output.
    assert!(descriptor.outputs.is_empty());

    // Identical submission, identical job hash.
    let again = run(&exec, manifest("main.sh", &[]), archive);
    assert_eq!(
        again.descriptor.unwrap().job_input_hash,
        descriptor.job_input_hash
    );
    assert_eq!(descriptor.job_input_hash.len(), 64);
}

#[test]
fn deterministic_output_hashes() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), None);
    let archive = build_archive(&[("main.sh", b"printf ok > result.txt\n".as_slice())]);

    let outcome = run(&exec, manifest("main.sh", &[]), archive.clone());
    let descriptor = outcome.descriptor.unwrap();
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(descriptor.outputs.len(), 1);
    assert_eq!(descriptor.outputs["result.txt"].sha256, sha256_hex(b"ok"));

    let again = run(&exec, manifest("main.sh", &[]), archive);
    assert_eq!(
        again.descriptor.unwrap().canonical_form(),
        descriptor.canonical_form()
    );
}

#[test]
fn output_filter_selects_lexicographically() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), None);
    let archive = build_archive(&[(
        "main.sh",
        b"touch a.png b.log c.png\n".as_slice(),
    )]);

    let outcome = run(&exec, manifest("main.sh", &["*.png"]), archive);
    let descriptor = outcome.descriptor.unwrap();
    let keys: Vec<&str> = descriptor.outputs.keys().map(|k| k.as_str()).collect();
    assert_eq!(keys, vec!["a.png", "c.png"]);

    let canonical = descriptor.canonical_form();
    let outputs_part = canonical.splitn(5, '|').nth(4).unwrap();
    assert!(outputs_part.starts_with("a.png:"));
    assert!(outputs_part.contains("|c.png:"));
}

#[test]
fn filter_with_no_matches_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), None);
    let archive = build_archive(&[("main.sh", b"echo done > out.log\n".as_slice())]);

    let outcome = run(&exec, manifest("main.sh", &["*.png"]), archive);
    assert_eq!(outcome.status, JobStatus::Completed);
    assert!(outcome.descriptor.unwrap().outputs.is_empty());
}

#[test]
fn failed_job_keeps_partial_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), None);
    let archive = build_archive(&[(
        "main.sh",
        b"printf partial > partial.txt\nexit 9\n".as_slice(),
    )]);

    let outcome = run(&exec, manifest("main.sh", &[]), archive);
    // A non-zero exit is still a completed execution, not a sandbox failure.
    assert_eq!(outcome.status, JobStatus::Completed);
    let descriptor = outcome.descriptor.unwrap();
    assert_eq!(descriptor.exit_code, Some(9));
    assert_eq!(
        descriptor.outputs["partial.txt"].sha256,
        sha256_hex(b"partial")
    );
}

#[test]
fn empty_archive_fails_with_no_entrypoint() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), None);
    let archive = build_archive(&[]);

    let outcome = run(&exec, manifest("main.sh", &[]), archive);
    assert_eq!(outcome.status, JobStatus::Failed);
    match outcome.failure {
        Some(FailureReason::Setup { detail }) => assert_eq!(detail, "no_entrypoint"),
        other => panic!("expected setup failure, got {other:?}"),
    }
    assert!(outcome.descriptor.is_none());
}

#[test]
fn timeout_produces_timed_out_status() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), None);
    let archive = build_archive(&[("main.sh", b"sleep 10\n".as_slice())]);
    let json = serde_json::json!({
        "entrypoint": "main.sh",
        "interpreter": "sh",
        "timeout_seconds": 1,
    });
    let manifest = JobManifest::parse(&serde_json::to_vec(&json).unwrap()).unwrap();

    let started = std::time::Instant::now();
    let outcome = run(&exec, manifest, archive);
    assert_eq!(outcome.status, JobStatus::TimedOut);
    assert_eq!(outcome.failure, Some(FailureReason::TimedOut));
    assert!(outcome.descriptor.unwrap().timed_out);
    assert!(started.elapsed() < std::time::Duration::from_secs(8));
}

#[test]
fn unknown_template_is_a_setup_failure() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), None);
    let archive = build_archive(&[("main.sh", b"echo hi\n".as_slice())]);
    let json = serde_json::json!({
        "entrypoint": "main.sh",
        "interpreter": "sh",
        "env_template": "missing",
    });
    let manifest = JobManifest::parse(&serde_json::to_vec(&json).unwrap()).unwrap();

    let outcome = run(&exec, manifest, archive);
    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(matches!(
        outcome.failure,
        Some(FailureReason::Setup { .. })
    ));
}

#[test]
fn signed_outcome_verifies_publicly() {
    let dir = tempfile::tempdir().unwrap();
    let identity = Arc::new(WorkerIdentity::generate());
    let worker_id = identity.worker_id();
    let exec = executor(dir.path(), Some(identity));
    let archive = build_archive(&[("main.sh", b"printf ok > result.txt\n".as_slice())]);

    let outcome = run(&exec, manifest("main.sh", &[]), archive);
    let metadata = outcome.worker_metadata.unwrap();
    assert_eq!(metadata.worker_id, worker_id);
    assert_eq!(metadata.signature_algorithm, "Ed25519");
    assert_eq!(
        metadata.signed_data,
        outcome.descriptor.unwrap().canonical_form()
    );
    assert!(verify(
        metadata.signed_data.as_bytes(),
        &metadata.signature,
        &metadata.worker_id
    ));
}

#[test]
fn anonymous_mode_omits_worker_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), None);
    let archive = build_archive(&[("main.sh", b"echo hi\n".as_slice())]);

    let outcome = run(&exec, manifest("main.sh", &[]), archive);
    assert_eq!(outcome.status, JobStatus::Completed);
    assert!(outcome.worker_metadata.is_none());
}

#[test]
fn work_dir_travels_out_and_is_destroyed_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), None);
    let archive = build_archive(&[("main.sh", b"echo hi > kept.txt\n".as_slice())]);

    let outcome = run(&exec, manifest("main.sh", &[]), archive);
    let work_dir = outcome.work_dir.unwrap();
    let job_root = work_dir.job_root().to_path_buf();
    assert!(job_root.exists());
    drop(work_dir);
    assert!(!job_root.exists());
}
