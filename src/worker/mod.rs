//! Worker execution engine for running submissions.
//!
//! # Components
//!
//! - [`Sandbox`]: runs untrusted code out of process with a time limit,
//!   bounded output capture and a hard kill
//! - [`verdict`]: maps a sandbox outcome to a verdict
//! - [`WorkerPool`]: fixed set of workers draining the job queue, with a
//!   supervisor that restarts crashed workers
//! - [`Watchdog`]: fails jobs that stay `running` past their liveness timeout
//!
//! # Execution Flow
//!
//! 1. A worker dequeues a job ID (arrival order)
//! 2. [`JobStore::begin`](crate::scheduler::JobStore::begin) moves it to
//!    `running` and returns a lease
//! 3. [`Sandbox::run`] executes the code
//! 4. [`verdict::judge`] classifies the outcome
//! 5. The lease writes the terminal state

pub mod pool;
pub mod sandbox;
pub mod verdict;
pub mod watchdog;

pub use pool::{WorkerContext, WorkerPool};
pub use sandbox::{Sandbox, SandboxOutcome};
pub use watchdog::Watchdog;
