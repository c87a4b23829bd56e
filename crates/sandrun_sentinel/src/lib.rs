//! Sandrun sentinel: admission, dispatch and the external operation
//! surface of the execution core.
//!
//! The transport collaborator (HTTP/WebSocket) sits in front of
//! [`service::SandrunService`] and translates its sum types into status
//! codes; nothing in here speaks a wire protocol.

pub mod queue;
pub mod ratelimit;
pub mod service;

pub use queue::{EnqueueOutcome, JobQueue, ShutdownMode, WorkerPool};
pub use ratelimit::{Admission, RateLimitConfig, RateLimiter};
pub use service::{JobLogs, SandrunService, Sentinel, SentinelConfig};
