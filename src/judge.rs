use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api;
use crate::config::{JudgeConfig, SandboxBackend};
use crate::error::Result;
use crate::metrics::JudgeMetrics;
use crate::scheduler::{JobQueue, JobStore};
use crate::service::{JudgeService, SubmissionLimits};
use crate::worker::{Sandbox, Watchdog, WorkerContext, WorkerPool};

/// Owns the store, queue, sandbox and metrics, and wires them into the
/// worker pool, the watchdog and the HTTP API.
pub struct Judge {
    config: JudgeConfig,
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    sandbox: Arc<Sandbox>,
    metrics: Arc<JudgeMetrics>,
}

impl Judge {
    pub fn new(config: JudgeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: Arc::new(JobStore::new()),
            queue: Arc::new(JobQueue::new(&config.queue)),
            sandbox: Arc::new(Sandbox::new(config.sandbox.clone())),
            metrics: Arc::new(JudgeMetrics::new()),
            config,
        })
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    pub fn service(&self) -> JudgeService {
        JudgeService::new(
            self.store.clone(),
            self.queue.clone(),
            self.metrics.clone(),
            SubmissionLimits {
                max_code_bytes: self.config.max_code_bytes,
                max_expected_bytes: self.config.sandbox.max_output_bytes,
            },
            self.config.worker.workers,
        )
    }

    pub fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            store: self.store.clone(),
            queue: self.queue.clone(),
            sandbox: self.sandbox.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn spawn_workers(&self, shutdown: CancellationToken) -> WorkerPool {
        WorkerPool::spawn(
            self.config.worker.workers,
            self.worker_context(),
            shutdown,
            self.config.worker.drain_timeout,
        )
    }

    pub fn watchdog(&self) -> Watchdog {
        Watchdog::new(
            self.store.clone(),
            self.metrics.clone(),
            self.config.liveness_timeout(),
            self.config.worker.watchdog_interval,
        )
    }

    pub fn spawn_watchdog(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.watchdog().run(shutdown))
    }

    /// Run every subsystem until `shutdown` fires:
    /// 1. Prepares the sandbox (pulls the image if missing)
    /// 2. Spawns the worker pool (with its supervisor)
    /// 3. Spawns the orphan watchdog
    /// 4. Serves the HTTP API (blocking)
    /// 5. Drains workers once the API has stopped
    ///
    /// # Errors
    ///
    /// Returns an error if the sandbox cannot be prepared, or if the listen
    /// address cannot be bound or the server fails. Workers are still
    /// drained in the latter case.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if self.config.sandbox.backend == SandboxBackend::Process {
            tracing::warn!(
                "Process sandbox backend has no network or filesystem isolation. \
                 Use the docker backend for untrusted code."
            );
        }
        self.sandbox.prepare().await?;

        let pool = self.spawn_workers(shutdown.clone());
        let watchdog = self.spawn_watchdog(shutdown.clone());

        let served = match TcpListener::bind(self.config.listen_addr).await {
            Ok(listener) => api::serve(listener, self.service(), shutdown.clone()).await,
            Err(e) => {
                tracing::error!(addr = %self.config.listen_addr, error = %e, "Failed to bind API");
                Err(e.into())
            }
        };

        // Server gone for whatever reason: stop everything else too
        shutdown.cancel();
        pool.join().await;
        if let Err(e) = watchdog.await {
            tracing::error!(error = %e, "Watchdog task failed");
        }
        served
    }
}
