//! Sandrun security module.
//!
//! Provides:
//! - **Hashing**: streaming SHA-256 over bytes, files and directory trees,
//!   with the one-star glob filter used for output selection
//! - **File typing**: extension-driven kind/MIME classification
//! - **Identity**: Ed25519 worker keypair lifecycle and result signing
//! - **Job hash**: the canonical job-input fingerprint

pub mod filetype;
pub mod hashing;
pub mod identity;
pub mod job_hash;

pub use identity::{verify, IdentityError, WorkerIdentity};
pub use job_hash::job_input_hash;
