//! Ed25519 worker identity.
//!
//! A worker host carries one keypair, generated once by an operator command
//! and persisted as a PKCS#8 PEM file. The worker ID is the base64 of the
//! 32-byte public key; verification is public and never needs the signing
//! key. Running without a key ("anonymous mode") is first-class: results
//! are produced unsigned but otherwise identical in shape.

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use pkcs8::LineEnding;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read key file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write key file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("key file {path} is not a valid Ed25519 PKCS#8 PEM: {detail}")]
    Malformed { path: String, detail: String },
}

/// A loaded Ed25519 keypair identifying this worker host.
pub struct WorkerIdentity {
    signing_key: SigningKey,
}

impl WorkerIdentity {
    /// Generate a fresh keypair. Operator path only; normal startup loads
    /// an existing PEM.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load the worker key from a PEM file written by [`save_pem`].
    ///
    /// [`save_pem`]: WorkerIdentity::save_pem
    pub fn load_pem(path: &Path) -> Result<Self, IdentityError> {
        let pem = fs::read_to_string(path).map_err(|source| IdentityError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let signing_key =
            SigningKey::from_pkcs8_pem(&pem).map_err(|e| IdentityError::Malformed {
                path: path.display().to_string(),
                detail: e.to_string(),
            })?;
        let identity = Self { signing_key };
        info!(worker_id = %identity.worker_id(), "worker identity loaded");
        Ok(identity)
    }

    /// Persist the private key as PKCS#8 PEM, readable only by the owner.
    pub fn save_pem(&self, path: &Path) -> Result<(), IdentityError> {
        let write_err = |source| IdentityError::Write {
            path: path.display().to_string(),
            source,
        };
        let pem = self
            .signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| IdentityError::Malformed {
                path: path.display().to_string(),
                detail: e.to_string(),
            })?;
        fs::write(path, pem.as_bytes()).map_err(write_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(write_err)?;
        }
        Ok(())
    }

    /// Base64 of the 32-byte public key. Stable across restarts for the
    /// same key file.
    pub fn worker_id(&self) -> String {
        general_purpose::STANDARD.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign the exact byte sequence; Ed25519 is deterministic, so the same
    /// input always yields the same signature.
    pub fn sign(&self, data: &[u8]) -> String {
        let signature: Signature = self.signing_key.sign(data);
        general_purpose::STANDARD.encode(signature.to_bytes())
    }
}

impl std::fmt::Debug for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The signing key never appears in logs.
        f.debug_struct("WorkerIdentity")
            .field("worker_id", &self.worker_id())
            .finish()
    }
}

/// Verify `signature_b64` over `data` with the public key encoded in
/// `worker_id_b64`. Rejects rather than faults: malformed base64, wrong
/// signature length, wrong key length and invalid signatures all return
/// false.
pub fn verify(data: &[u8], signature_b64: &str, worker_id_b64: &str) -> bool {
    let Ok(signature_bytes) = general_purpose::STANDARD.decode(signature_b64) else {
        return false;
    };
    let Ok(signature_bytes) = <[u8; 64]>::try_from(signature_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&signature_bytes);

    let Ok(key_bytes) = general_purpose::STANDARD.decode(worker_id_b64) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };

    verifying_key.verify_strict(data, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_identity_law() {
        let identity = WorkerIdentity::generate();
        let sig = identity.sign(b"payload");
        assert!(verify(b"payload", &sig, &identity.worker_id()));
    }

    #[test]
    fn signing_is_deterministic() {
        let identity = WorkerIdentity::generate();
        assert_eq!(identity.sign(b"same"), identity.sign(b"same"));
    }

    #[test]
    fn tampered_payload_fails() {
        let identity = WorkerIdentity::generate();
        let sig = identity.sign(b"original");
        assert!(!verify(b"tampered", &sig, &identity.worker_id()));
    }

    #[test]
    fn wrong_worker_fails() {
        let signer = WorkerIdentity::generate();
        let other = WorkerIdentity::generate();
        let sig = signer.sign(b"payload");
        assert!(!verify(b"payload", &sig, &other.worker_id()));
    }

    #[test]
    fn malformed_inputs_reject_without_fault() {
        let identity = WorkerIdentity::generate();
        let sig = identity.sign(b"x");
        let id = identity.worker_id();

        assert!(!verify(b"x", "not base64!!", &id));
        assert!(!verify(b"x", &sig, "not base64!!"));
        // Right encoding, wrong lengths.
        let short_sig = general_purpose::STANDARD.encode([0u8; 16]);
        assert!(!verify(b"x", &short_sig, &id));
        let short_key = general_purpose::STANDARD.encode([0u8; 16]);
        assert!(!verify(b"x", &sig, &short_key));
    }

    #[test]
    fn pem_roundtrip_preserves_worker_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.pem");
        let identity = WorkerIdentity::generate();
        identity.save_pem(&path).unwrap();

        let reloaded = WorkerIdentity::load_pem(&path).unwrap();
        assert_eq!(identity.worker_id(), reloaded.worker_id());
        // And the reloaded key produces signatures the original id verifies.
        let sig = reloaded.sign(b"data");
        assert!(verify(b"data", &sig, &identity.worker_id()));
    }

    #[cfg(unix)]
    #[test]
    fn saved_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.pem");
        WorkerIdentity::generate().save_pem(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn garbage_pem_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pem");
        std::fs::write(&path, "-----BEGIN GARBAGE-----\nzzzz\n-----END GARBAGE-----\n").unwrap();
        assert!(matches!(
            WorkerIdentity::load_pem(&path),
            Err(IdentityError::Malformed { .. })
        ));
    }
}
