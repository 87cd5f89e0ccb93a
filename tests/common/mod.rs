//! Shared fixtures. Jobs run as `sh` scripts through the process backend so
//! the suite needs neither docker nor a python interpreter.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orbit_judge::config::SandboxConfig;
use orbit_judge::metrics::JudgeMetrics;
use orbit_judge::scheduler::{Job, JobQueue, JobStore};
use orbit_judge::service::{JobView, JudgeService, SubmissionLimits};
use orbit_judge::worker::{Sandbox, WorkerContext, WorkerPool};

pub fn sh_sandbox(time_limit: Duration) -> SandboxConfig {
    SandboxConfig::process(&["sh"], "main.sh").with_time_limit(time_limit)
}

pub fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Store, queue, sandbox and metrics wired together without the HTTP layer.
pub struct Harness {
    pub store: Arc<JobStore>,
    pub queue: Arc<JobQueue>,
    pub metrics: Arc<JudgeMetrics>,
    pub sandbox: Arc<Sandbox>,
    pub workers: usize,
}

impl Harness {
    pub fn new(sandbox: SandboxConfig, queue_capacity: usize, workers: usize) -> Self {
        Self {
            store: Arc::new(JobStore::new()),
            queue: Arc::new(JobQueue::with_capacity(queue_capacity)),
            metrics: Arc::new(JudgeMetrics::new()),
            sandbox: Arc::new(Sandbox::new(sandbox)),
            workers,
        }
    }

    pub fn context(&self) -> WorkerContext {
        WorkerContext {
            store: self.store.clone(),
            queue: self.queue.clone(),
            sandbox: self.sandbox.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn service(&self) -> JudgeService {
        JudgeService::new(
            self.store.clone(),
            self.queue.clone(),
            self.metrics.clone(),
            SubmissionLimits {
                max_code_bytes: 64 * 1024,
                max_expected_bytes: 64 * 1024,
            },
            self.workers,
        )
    }

    pub fn spawn_pool(&self, shutdown: &CancellationToken, drain_timeout: Duration) -> WorkerPool {
        WorkerPool::spawn(self.workers, self.context(), shutdown.clone(), drain_timeout)
    }

    /// Insert a job straight into the store and queue.
    pub fn enqueue(&self, code: &str, expected: &str) -> Uuid {
        let job = Job::new(code.to_string(), expected.to_string());
        let id = job.id;
        self.store.insert(job).unwrap();
        self.queue.try_enqueue(id).unwrap();
        id
    }
}

/// Poll the service until the job is terminal.
pub async fn wait_terminal(service: &JudgeService, job_id: &Uuid, timeout: Duration) -> JobView {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let view = service.status(job_id).unwrap();
        if view.is_terminal() {
            return view;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} still {} after {:?}",
            job_id,
            view.status,
            timeout
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
