use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::metrics::JudgeMetrics;
use crate::scheduler::{JobStore, Verdict};

const ORPHAN_REASON: &str = "job exceeded its liveness timeout without a result (worker lost)";

/// Fails jobs stuck in `running` longer than the liveness timeout.
///
/// The sandbox enforces the time limit itself, so a job outliving
/// `time_limit + grace` means its worker is gone or wedged.
#[derive(Debug, Clone)]
pub struct Watchdog {
    store: Arc<JobStore>,
    metrics: Arc<JudgeMetrics>,
    liveness_timeout: Duration,
    interval: Duration,
}

impl Watchdog {
    pub fn new(
        store: Arc<JobStore>,
        metrics: Arc<JudgeMetrics>,
        liveness_timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            liveness_timeout,
            interval,
        }
    }

    /// One scan over the store. Returns how many jobs were failed.
    pub fn sweep(&self) -> usize {
        let mut failed = 0;
        for job_id in self.store.stale_running(self.liveness_timeout) {
            if self
                .store
                .fail_if_stale(&job_id, self.liveness_timeout, ORPHAN_REASON)
            {
                tracing::warn!(
                    job_id = %job_id,
                    liveness_timeout_ms = self.liveness_timeout.as_millis() as u64,
                    "Orphaned job failed by watchdog"
                );
                self.metrics.orphaned_jobs.inc();
                self.metrics.record_verdict(Verdict::InternalError);
                failed += 1;
            }
        }
        failed
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep();
                }
            }
        }
        tracing::debug!("Watchdog stopped");
    }
}
