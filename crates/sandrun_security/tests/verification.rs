//! End-to-end signature verification over the canonical result form.
//!
//! Exercises the public-verification contract: a client rebuilds the
//! canonical string from the result fields and checks the signature with
//! nothing but the worker ID.

use sandrun_protocol::{JobId, OutputSet, ResultDescriptor};
use sandrun_security::hashing::{hash_directory, sha256_hex};
use sandrun_security::{verify, WorkerIdentity};
use std::fs;

fn descriptor_for(dir: &std::path::Path) -> ResultDescriptor {
    ResultDescriptor {
        job_id: JobId::parse("6b7e9b54-3a2f-47b1-9f20-52a27f0c4a11").unwrap(),
        job_input_hash: sha256_hex(b"job-input"),
        exit_code: Some(0),
        cpu_seconds: 0.25,
        memory_peak_bytes: 8 * 1024 * 1024,
        outputs: hash_directory(dir, &[]),
        timed_out: false,
    }
}

#[test]
fn tampering_with_an_output_invalidates_the_signature() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("out.txt"), b"original").unwrap();

    let identity = WorkerIdentity::generate();
    let worker_id = identity.worker_id();

    let descriptor = descriptor_for(dir.path());
    let signed_data = descriptor.canonical_form();
    let signature = identity.sign(signed_data.as_bytes());

    // The stored signature verifies against the stored form, even with the
    // signing key gone.
    drop(identity);
    assert!(verify(signed_data.as_bytes(), &signature, &worker_id));

    // Alter the output on disk and re-hash: the canonical form changes and
    // the old signature no longer covers it.
    fs::write(dir.path().join("out.txt"), b"tampered").unwrap();
    let rehashed = descriptor_for(dir.path());
    let altered_form = rehashed.canonical_form();
    assert_ne!(altered_form, signed_data);
    assert!(!verify(altered_form.as_bytes(), &signature, &worker_id));
}

#[test]
fn canonical_form_is_reproducible_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("result.txt"), b"ok").unwrap();

    let first = descriptor_for(dir.path());
    let second = descriptor_for(dir.path());
    assert_eq!(first.canonical_form(), second.canonical_form());
    assert_eq!(
        first.outputs["result.txt"].sha256,
        sha256_hex(b"ok"),
    );

    // A keyed worker therefore produces byte-identical signatures for
    // byte-identical results.
    let identity = WorkerIdentity::generate();
    assert_eq!(
        identity.sign(first.canonical_form().as_bytes()),
        identity.sign(second.canonical_form().as_bytes()),
    );
}
