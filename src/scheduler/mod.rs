//! Job bookkeeping shared by the API and the workers.
//!
//! - [`JobStore`]: every job record, keyed by ID, with checked transitions
//! - [`JobQueue`]: bounded FIFO of job IDs feeding the worker pool

pub mod job;
pub mod queue;
pub mod store;

pub use job::{Job, JobOutcome, JobStatus, Verdict};
pub use queue::JobQueue;
pub use store::{ExecutionLease, JobStore};
