//! Process-wide counters and gauges, exported in Prometheus text format on
//! `GET /metrics`.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::scheduler::Verdict;

/// Monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct JudgeMetrics {
    pub jobs_submitted: Counter,
    /// Submissions turned away because the queue was saturated
    pub jobs_rejected: Counter,
    pub validation_failures: Counter,
    pub active_workers: Gauge,
    pub worker_restarts: Counter,
    pub orphaned_jobs: Counter,
    processed: [Counter; Verdict::ALL.len()],
}

impl JudgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_verdict(&self, verdict: Verdict) {
        self.processed[verdict_index(verdict)].inc();
    }

    pub fn processed(&self, verdict: Verdict) -> u64 {
        self.processed[verdict_index(verdict)].get()
    }

    pub fn processed_total(&self) -> u64 {
        self.processed.iter().map(Counter::get).sum()
    }

    /// Marks one worker busy until the guard is dropped.
    pub fn worker_busy(&self) -> BusyGuard<'_> {
        self.active_workers.inc();
        BusyGuard { gauge: &self.active_workers }
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self, queue_depth: usize) -> String {
        let mut out = String::new();
        counter(&mut out, "orbit_jobs_submitted_total", "Jobs accepted into the queue", self.jobs_submitted.get());
        counter(&mut out, "orbit_jobs_rejected_total", "Submissions rejected because the queue was full", self.jobs_rejected.get());
        counter(&mut out, "orbit_validation_failures_total", "Submissions rejected as invalid", self.validation_failures.get());

        let _ = writeln!(out, "# HELP orbit_jobs_processed_total Jobs that reached a terminal state");
        let _ = writeln!(out, "# TYPE orbit_jobs_processed_total counter");
        for verdict in Verdict::ALL {
            let _ = writeln!(
                out,
                "orbit_jobs_processed_total{{verdict=\"{}\"}} {}",
                verdict,
                self.processed(verdict)
            );
        }

        gauge(&mut out, "orbit_active_workers", "Workers currently executing a job", self.active_workers.get());
        gauge(&mut out, "orbit_queue_depth", "Jobs waiting for a worker", queue_depth as i64);
        counter(&mut out, "orbit_worker_restarts_total", "Workers restarted after a crash", self.worker_restarts.get());
        counter(&mut out, "orbit_orphaned_jobs_total", "Running jobs failed by the watchdog", self.orphaned_jobs.get());
        out
    }
}

pub struct BusyGuard<'a> {
    gauge: &'a Gauge,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

fn verdict_index(verdict: Verdict) -> usize {
    match verdict {
        Verdict::Accepted => 0,
        Verdict::WrongAnswer => 1,
        Verdict::RuntimeError => 2,
        Verdict::TimeLimitExceeded => 3,
        Verdict::InternalError => 4,
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}", name, value);
}

fn gauge(out: &mut String, name: &str, help: &str, value: i64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}", name, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_counters_are_independent() {
        let metrics = JudgeMetrics::new();
        metrics.record_verdict(Verdict::Accepted);
        metrics.record_verdict(Verdict::Accepted);
        metrics.record_verdict(Verdict::TimeLimitExceeded);

        assert_eq!(metrics.processed(Verdict::Accepted), 2);
        assert_eq!(metrics.processed(Verdict::TimeLimitExceeded), 1);
        assert_eq!(metrics.processed(Verdict::WrongAnswer), 0);
        assert_eq!(metrics.processed_total(), 3);
    }

    #[test]
    fn busy_guard_tracks_active_workers() {
        let metrics = JudgeMetrics::new();
        {
            let _a = metrics.worker_busy();
            let _b = metrics.worker_busy();
            assert_eq!(metrics.active_workers.get(), 2);
        }
        assert_eq!(metrics.active_workers.get(), 0);
    }

    #[test]
    fn render_uses_prometheus_text_format() {
        let metrics = JudgeMetrics::new();
        metrics.jobs_submitted.inc();
        metrics.record_verdict(Verdict::WrongAnswer);

        let text = metrics.render(7);
        assert!(text.contains("# TYPE orbit_jobs_submitted_total counter\norbit_jobs_submitted_total 1\n"));
        assert!(text.contains("orbit_jobs_processed_total{verdict=\"WrongAnswer\"} 1\n"));
        assert!(text.contains("orbit_jobs_processed_total{verdict=\"Accepted\"} 0\n"));
        assert!(text.contains("orbit_queue_depth 7\n"));
    }
}
