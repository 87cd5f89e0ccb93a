use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metrics::JudgeMetrics;
use crate::scheduler::{JobQueue, JobStore, Verdict};
use crate::worker::sandbox::Sandbox;
use crate::worker::verdict;

/// How often the supervisor checks for dead workers
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(200);

/// Everything a worker touches. Workers share nothing else.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub store: Arc<JobStore>,
    pub queue: Arc<JobQueue>,
    pub sandbox: Arc<Sandbox>,
    pub metrics: Arc<JudgeMetrics>,
}

impl WorkerContext {
    /// Run one dequeued job through the sandbox and record its verdict.
    ///
    /// The lease taken from the store guarantees a terminal state even if
    /// this future panics or is dropped halfway.
    pub async fn execute(&self, worker_id: usize, job_id: Uuid) {
        let lease = match self.store.begin(job_id, worker_id) {
            Ok(lease) => lease.with_metrics(self.metrics.clone()),
            Err(e) => {
                tracing::warn!(job_id = %job_id, worker_id, error = %e, "Dequeued job cannot start");
                return;
            }
        };
        let _busy = self.metrics.worker_busy();
        tracing::info!(job_id = %job_id, worker_id, "Job started");

        let outcome = self.sandbox.run(job_id, lease.code()).await;
        let result = verdict::judge(
            &outcome,
            lease.expected_output(),
            self.sandbox.config().stderr_tail_bytes,
        );
        let verdict = result.verdict;
        if verdict == Verdict::InternalError {
            tracing::error!(
                job_id = %job_id,
                worker_id,
                reason = %result.actual_output,
                "Sandbox malfunction"
            );
        }

        match lease.finish(result) {
            Ok(status) => {
                self.metrics.record_verdict(verdict);
                tracing::info!(
                    job_id = %job_id,
                    worker_id,
                    status = %status,
                    verdict = %verdict,
                    "Job finished"
                );
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, worker_id, error = %e, "Result discarded, job already terminal");
            }
        }
    }
}

/// Fixed-size set of workers pulling from the job queue.
///
/// A supervisor task restarts any worker that dies so the pool stays at its
/// configured size. On shutdown workers stop dequeuing, in-flight jobs get
/// `drain_timeout` to finish, and the rest are aborted.
pub struct WorkerPool {
    supervisor: JoinHandle<()>,
    size: usize,
}

impl WorkerPool {
    pub fn spawn(
        size: usize,
        ctx: WorkerContext,
        shutdown: CancellationToken,
        drain_timeout: Duration,
    ) -> Self {
        tracing::info!(workers = size, "Starting worker pool");
        let supervisor = tokio::spawn(supervise(size, ctx, shutdown, drain_timeout));
        Self { supervisor, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait until every worker has stopped. Only returns after the shutdown
    /// token fires.
    pub async fn join(self) {
        if let Err(e) = self.supervisor.await {
            tracing::error!(error = %e, "Worker supervisor failed");
        }
    }
}

fn spawn_worker(worker_id: usize, ctx: &WorkerContext, shutdown: &CancellationToken) -> JoinHandle<()> {
    tokio::spawn(worker_loop(worker_id, ctx.clone(), shutdown.clone()))
}

async fn worker_loop(worker_id: usize, ctx: WorkerContext, shutdown: CancellationToken) {
    tracing::debug!(worker_id, "Worker ready");
    loop {
        let job_id = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = ctx.queue.dequeue() => match next {
                Some(job_id) => job_id,
                None => break,
            },
        };
        // Not raced against shutdown: a started job runs to completion
        ctx.execute(worker_id, job_id).await;
    }
    tracing::debug!(worker_id, "Worker stopped");
}

async fn supervise(
    size: usize,
    ctx: WorkerContext,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) {
    let mut workers: Vec<JoinHandle<()>> = (0..size)
        .map(|worker_id| spawn_worker(worker_id, &ctx, &shutdown))
        .collect();
    let mut check = tokio::time::interval(SUPERVISE_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = check.tick() => {
                for (worker_id, handle) in workers.iter_mut().enumerate() {
                    if !handle.is_finished() || shutdown.is_cancelled() {
                        continue;
                    }
                    let dead = std::mem::replace(handle, spawn_worker(worker_id, &ctx, &shutdown));
                    match dead.await {
                        Err(e) if e.is_panic() => {
                            tracing::error!(worker_id, "Worker panicked, restarting");
                        }
                        _ => tracing::warn!(worker_id, "Worker exited unexpectedly, restarting"),
                    }
                    ctx.metrics.worker_restarts.inc();
                }
            }
        }
    }

    drain(workers, drain_timeout).await;
}

async fn drain(workers: Vec<JoinHandle<()>>, drain_timeout: Duration) {
    tracing::info!(
        workers = workers.len(),
        drain_timeout_ms = drain_timeout.as_millis() as u64,
        "Draining workers"
    );
    let deadline = tokio::time::Instant::now() + drain_timeout;
    let mut aborted = 0usize;

    for mut handle in workers {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            // Dropping the task drops its lease, which records the job as failed
            handle.abort();
            let _ = handle.await;
            aborted += 1;
        }
    }

    if aborted > 0 {
        tracing::warn!(aborted, "Drain timeout reached, in-flight jobs aborted");
    } else {
        tracing::info!("All workers drained");
    }
}
