//! Sandrun worker: the execution side of the core.
//!
//! Owns everything between an admitted submission and its result
//! descriptor: staging the archive onto RAM-backed storage, preparing a
//! cached environment clone, supervising the sandboxed child, hashing and
//! signing the outputs, and destroying the work dir.

pub mod cancel;
pub mod env_manager;
pub mod executor;
pub mod sandbox;
pub mod workspace;

pub use cancel::CancellationToken;
pub use env_manager::{EnvError, EnvStats, EnvironmentManager, EnvironmentTemplate};
pub use executor::{ExecutorDeps, JobExecutor, JobOutcome, PreparedJob};
pub use workspace::{StageError, WorkDir};
