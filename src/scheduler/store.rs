use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{JudgeError, Result};
use crate::metrics::JudgeMetrics;
use crate::scheduler::job::{Job, JobOutcome, JobStatus, Verdict};

/// Owns every job record for the lifetime of the process.
///
/// All mutation goes through transition methods that check the
/// `queued -> running -> terminal` edges under the write lock. Reads return
/// cloned snapshots, so a reader sees either the whole terminal result or
/// none of it.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave a half-written job: every
    // write assigns plain fields after all checks have passed.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a freshly submitted job.
    pub fn insert(&self, job: Job) -> Result<()> {
        let mut jobs = self.write();
        if jobs.contains_key(&job.id) {
            return Err(JudgeError::DuplicateJob(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    /// Snapshot of a job by ID
    pub fn get(&self, id: &Uuid) -> Option<Job> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.read().contains_key(id)
    }

    /// Remove a job that was never handed to the queue. Only queued jobs can
    /// be discarded; returns false otherwise.
    pub(crate) fn discard_queued(&self, id: &Uuid) -> bool {
        let mut jobs = self.write();
        match jobs.get(id) {
            Some(job) if job.status == JobStatus::Queued => {
                jobs.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Move a queued job to `running` and hand the caller the exclusive right
    /// to finish it.
    pub fn begin(self: &Arc<Self>, id: Uuid, worker_id: usize) -> Result<ExecutionLease> {
        let mut jobs = self.write();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| JudgeError::NotFound(id.to_string()))?;

        if !job.status.can_transition_to(JobStatus::Running) {
            return Err(JudgeError::InvalidTransition {
                job_id: id,
                from: job.status,
                to: JobStatus::Running,
            });
        }
        job.start(worker_id);

        Ok(ExecutionLease {
            store: Arc::clone(self),
            job_id: id,
            worker_id,
            code: job.code.clone(),
            expected_output: job.expected_output.clone(),
            metrics: None,
            finished: false,
        })
    }

    /// Record the terminal result of a running job.
    pub fn finish(&self, id: Uuid, outcome: JobOutcome) -> Result<JobStatus> {
        let mut jobs = self.write();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| JudgeError::NotFound(id.to_string()))?;

        let next = outcome.verdict.terminal_status();
        if !job.status.can_transition_to(next) {
            return Err(JudgeError::InvalidTransition {
                job_id: id,
                from: job.status,
                to: next,
            });
        }
        job.finish(outcome);
        Ok(next)
    }

    /// IDs of jobs that have been `running` for longer than `older_than`.
    pub fn stale_running(&self, older_than: Duration) -> Vec<Uuid> {
        self.read()
            .values()
            .filter(|job| is_stale(job, older_than))
            .map(|job| job.id)
            .collect()
    }

    /// Fail a job as orphaned if it is still running past `older_than`.
    /// Re-checked under the write lock so a worker finishing concurrently
    /// wins cleanly.
    pub fn fail_if_stale(&self, id: &Uuid, older_than: Duration, reason: &str) -> bool {
        let mut jobs = self.write();
        match jobs.get_mut(id) {
            Some(job) if is_stale(job, older_than) => {
                job.finish(JobOutcome::internal_error(reason));
                true
            }
            _ => false,
        }
    }

    /// Get all jobs sorted chronologically by creation time
    pub fn all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.read().values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.read().values().filter(|j| j.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

fn is_stale(job: &Job, older_than: Duration) -> bool {
    if job.status != JobStatus::Running {
        return false;
    }
    job.started_at
        .and_then(|started| (Utc::now() - started).to_std().ok())
        .is_some_and(|elapsed| elapsed > older_than)
}

/// A worker's exclusive right to finish one running job.
///
/// If the lease is dropped without [`ExecutionLease::finish`] (the worker
/// panicked or was aborted), the job is recorded as `InternalError` so it
/// never stays `running`.
#[derive(Debug)]
pub struct ExecutionLease {
    store: Arc<JobStore>,
    job_id: Uuid,
    worker_id: usize,
    code: String,
    expected_output: String,
    /// Counts the verdict recorded on drop
    metrics: Option<Arc<JudgeMetrics>>,
    finished: bool,
}

impl ExecutionLease {
    pub fn with_metrics(mut self, metrics: Arc<JudgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn expected_output(&self) -> &str {
        &self.expected_output
    }

    pub fn finish(mut self, outcome: JobOutcome) -> Result<JobStatus> {
        self.finished = true;
        self.store.finish(self.job_id, outcome)
    }
}

impl Drop for ExecutionLease {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let reason = if std::thread::panicking() {
            "worker panicked while executing the job"
        } else {
            "worker stopped before the job finished"
        };
        match self
            .store
            .finish(self.job_id, JobOutcome::internal_error(reason))
        {
            Ok(_) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_verdict(Verdict::InternalError);
                }
                tracing::error!(
                    job_id = %self.job_id,
                    worker_id = self.worker_id,
                    reason,
                    "Job abandoned by worker, recorded as internal error"
                );
            }
            // Already terminal, e.g. failed by the watchdog first
            Err(e) => tracing::debug!(job_id = %self.job_id, error = %e, "Abandoned lease not applied"),
        }
    }
}
