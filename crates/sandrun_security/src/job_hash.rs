//! Canonical job-input hash.
//!
//! Two logically identical jobs must hash identically; any change to any
//! field must change the hash. Fields are separated with the ASCII Unit
//! Separator (0x1F) so path and argument bytes cannot collide with the
//! framing, and args are joined with the same byte so `["ab"]` and
//! `["a", "b"]` stay distinct.

use sandrun_protocol::defaults::FIELD_SEPARATOR;
use sandrun_protocol::JobManifest;
use sha2::{Digest, Sha256};

/// SHA-256 over the canonical encoding
/// `entrypoint 1F interpreter 1F env_template 1F args_joined 1F entrypoint_bytes`.
pub fn job_input_hash(manifest: &JobManifest, entrypoint_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    for field in [
        manifest.entrypoint.as_str(),
        manifest.interpreter.as_str(),
        manifest.env_template.as_str(),
    ] {
        hasher.update(field.as_bytes());
        hasher.update([FIELD_SEPARATOR]);
    }
    for (i, arg) in manifest.args.iter().enumerate() {
        if i > 0 {
            hasher.update([FIELD_SEPARATOR]);
        }
        hasher.update(arg.as_bytes());
    }
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(entrypoint_bytes);
    hex::encode(hasher.finalize())
}
