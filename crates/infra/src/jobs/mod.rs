//! Durable job queue with worker pools, retry/backoff and a dead set.
//!
//! ## Design
//!
//! - Jobs belong to a named queue and carry a `kind` selecting the handler
//! - Delivery is at-least-once: a lease that expires without an outcome puts
//!   the job back to pending
//! - Failed runs are retried with backoff until `max_attempts`, then the job
//!   moves to the dead set for inspection or manual requeue
//! - Every state transition is one atomic store operation, so any number of
//!   processes can serve the same queues
//!
//! ## Components
//!
//! - `Job`: unit of work and its state machine
//! - `JobStore`: atomic persistence (in-memory or Redis)
//! - `Engine`: handler registry, producer entry point, pools and reaper
//! - `JobHandler`: business logic contract

pub mod engine;
pub mod handler;
pub mod store;
pub mod types;
mod worker;

pub use engine::{Engine, EngineError, EnqueueOptions, ShutdownReport};
pub use handler::{
    HandlerError, HandlerOptions, JobContext, JobHandler, JobOutput, ProgressReporter,
};
pub use store::{JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, Job, JobAttemptRecord, JobState, Lease, QueueStats, ReapOutcome, ReapedJob,
    RetryPolicy,
};
