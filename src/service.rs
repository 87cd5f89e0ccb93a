use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{JudgeError, Result};
use crate::metrics::JudgeMetrics;
use crate::scheduler::{Job, JobQueue, JobStatus, JobStore, Verdict};

/// Upper bounds applied to every submission
#[derive(Debug, Clone, Copy)]
pub struct SubmissionLimits {
    pub max_code_bytes: usize,
    /// Expected output longer than the capture limit could never match
    pub max_expected_bytes: usize,
}

/// Client-facing view of a job. Result fields are absent until the job is
/// terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_by: Option<usize>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobView {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            verdict: job.verdict,
            actual_output: job.actual_output,
            exit_code: job.exit_code,
            executed_by: job.executed_by,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Submit and status operations, independent of the HTTP layer.
#[derive(Debug, Clone)]
pub struct JudgeService {
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    metrics: Arc<JudgeMetrics>,
    limits: SubmissionLimits,
    workers: usize,
}

impl JudgeService {
    pub fn new(
        store: Arc<JobStore>,
        queue: Arc<JobQueue>,
        metrics: Arc<JudgeMetrics>,
        limits: SubmissionLimits,
        workers: usize,
    ) -> Self {
        Self {
            store,
            queue,
            metrics,
            limits,
            workers,
        }
    }

    /// Validate, record and enqueue a submission. Returns as soon as the job
    /// is queued; execution happens later on a worker.
    pub async fn submit(&self, code: String, expected_output: String) -> Result<Uuid> {
        if let Err(e) = self.validate(&code, &expected_output) {
            self.metrics.validation_failures.inc();
            return Err(e);
        }

        let job = Job::new(code, expected_output);
        let job_id = job.id;
        self.store.insert(job)?;

        if let Err(e) = self.queue.enqueue(job_id).await {
            // The ID was never handed out, so the job never existed
            self.store.discard_queued(&job_id);
            self.metrics.jobs_rejected.inc();
            tracing::warn!(
                job_id = %job_id,
                queue_depth = self.queue.depth(),
                error = %e,
                "Submission rejected"
            );
            return Err(e);
        }

        self.metrics.jobs_submitted.inc();
        tracing::info!(job_id = %job_id, queue_depth = self.queue.depth(), "Job queued");
        Ok(job_id)
    }

    fn validate(&self, code: &str, expected_output: &str) -> Result<()> {
        if code.trim().is_empty() {
            return Err(JudgeError::Validation("code cannot be empty".to_string()));
        }
        if code.len() > self.limits.max_code_bytes {
            return Err(JudgeError::Validation(format!(
                "code is {} bytes, limit is {}",
                code.len(),
                self.limits.max_code_bytes
            )));
        }
        if expected_output.len() > self.limits.max_expected_bytes {
            return Err(JudgeError::Validation(format!(
                "expected_output is {} bytes, limit is {}",
                expected_output.len(),
                self.limits.max_expected_bytes
            )));
        }
        Ok(())
    }

    /// Current state of a job. Never waits for completion.
    pub fn status(&self, job_id: &Uuid) -> Result<JobView> {
        self.store
            .get(job_id)
            .map(JobView::from)
            .ok_or_else(|| JudgeError::NotFound(job_id.to_string()))
    }

    /// Like [`status`](Self::status) for an unparsed ID; malformed IDs are
    /// simply unknown.
    pub fn status_str(&self, job_id: &str) -> Result<JobView> {
        let id = Uuid::parse_str(job_id).map_err(|_| JudgeError::NotFound(job_id.to_string()))?;
        self.status(&id)
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<JudgeMetrics> {
        &self.metrics
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}
