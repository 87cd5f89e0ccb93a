use std::net::SocketAddr;
use std::time::Duration;

use clap::ValueEnum;

use crate::error::{JudgeError, Result};

/// Where submitted code is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SandboxBackend {
    /// One throwaway Docker container per job (network off, read-only root,
    /// dropped capabilities).
    Docker,
    /// A local child process in its own process group with rlimits and a
    /// scrubbed environment. Not network-isolated; development and tests only.
    Process,
}

impl std::fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxBackend::Docker => write!(f, "docker"),
            SandboxBackend::Process => write!(f, "process"),
        }
    }
}

/// Configuration for sandboxed code execution.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    /// Docker image used by the docker backend
    pub image: String,
    /// Docker CLI binary
    pub docker_binary: String,
    /// Interpreter command; the source file path is appended as last argument
    pub interpreter: Vec<String>,
    /// File name the submitted code is written to inside the scratch dir
    pub source_file: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory ceiling in MiB (container memory, or RLIMIT_AS for processes)
    pub memory_limit_mb: Option<u64>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
    /// Maximum number of processes inside the container
    pub pids_limit: Option<u32>,
    /// Wall-clock limit per job. Exceeding it kills the job.
    pub time_limit: Duration,
    /// Per-stream capture ceiling for stdout and stderr
    pub max_output_bytes: usize,
    /// How much of stderr is appended to the output of a runtime error
    pub stderr_tail_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Docker,
            image: "python:3.12-alpine".to_string(),
            docker_binary: "docker".to_string(),
            interpreter: vec!["python3".to_string(), "-I".to_string(), "-B".to_string()],
            source_file: "main.py".to_string(),
            network_disabled: true,
            memory_limit_mb: Some(128),
            cpu_limit: Some("0.5".to_string()),
            pids_limit: Some(64),
            time_limit: Duration::from_secs(5),
            max_output_bytes: 64 * 1024,
            stderr_tail_bytes: 1024,
        }
    }
}

impl SandboxConfig {
    /// Local process backend running `interpreter <scratch>/<source_file>`.
    pub fn process(interpreter: &[&str], source_file: &str) -> Self {
        Self {
            backend: SandboxBackend::Process,
            interpreter: interpreter.iter().map(|s| s.to_string()).collect(),
            source_file: source_file.to_string(),
            ..Default::default()
        }
    }

    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }
}

/// What `Submit` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueueOverflow {
    /// Fail fast with `QueueSaturated`
    Reject,
    /// Wait up to `enqueue_timeout` for a free slot, then fail
    Block,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow: QueueOverflow,
    pub enqueue_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: QueueOverflow::Reject,
            enqueue_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent executors
    pub workers: usize,
    /// Slack on top of the time limit before a running job counts as orphaned
    pub liveness_grace: Duration,
    /// How often the watchdog scans for orphaned jobs
    pub watchdog_interval: Duration,
    /// How long shutdown waits for in-flight jobs
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            liveness_grace: Duration::from_secs(10),
            watchdog_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub listen_addr: SocketAddr,
    /// Maximum accepted source size in bytes
    pub max_code_bytes: usize,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub sandbox: SandboxConfig,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_code_bytes: 64 * 1024,
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl JudgeConfig {
    pub fn new(listen_addr: SocketAddr, sandbox: SandboxConfig) -> Self {
        Self {
            listen_addr,
            sandbox,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.worker.workers = workers;
        self
    }

    pub fn with_queue(mut self, capacity: usize, overflow: QueueOverflow) -> Self {
        self.queue.capacity = capacity;
        self.queue.overflow = overflow;
        self
    }

    /// A job running longer than this is considered orphaned.
    pub fn liveness_timeout(&self) -> Duration {
        self.sandbox.time_limit + self.worker.liveness_grace
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.workers == 0 {
            return Err(JudgeError::Validation("worker pool size must be at least 1".into()));
        }
        if self.queue.capacity == 0 {
            return Err(JudgeError::Validation("queue capacity must be at least 1".into()));
        }
        if self.sandbox.time_limit.is_zero() {
            return Err(JudgeError::Validation("time limit must be positive".into()));
        }
        if self.sandbox.interpreter.is_empty() {
            return Err(JudgeError::Validation("interpreter command is empty".into()));
        }
        if self.sandbox.max_output_bytes == 0 {
            return Err(JudgeError::Validation("output limit must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.backend, SandboxBackend::Docker);
        assert_eq!(cfg.image, "python:3.12-alpine");
        assert!(cfg.network_disabled);
        assert_eq!(cfg.memory_limit_mb, Some(128));
        assert_eq!(cfg.cpu_limit.as_deref(), Some("0.5"));
        assert_eq!(cfg.time_limit, Duration::from_secs(5));
        assert_eq!(cfg.source_file, "main.py");
    }

    #[test]
    fn process_sandbox_keeps_limits() {
        let cfg = SandboxConfig::process(&["sh"], "main.sh").with_time_limit(Duration::from_millis(800));
        assert_eq!(cfg.backend, SandboxBackend::Process);
        assert_eq!(cfg.interpreter, vec!["sh".to_string()]);
        assert_eq!(cfg.source_file, "main.sh");
        assert_eq!(cfg.time_limit, Duration::from_millis(800));
        assert_eq!(cfg.max_output_bytes, 64 * 1024);
    }

    #[test]
    fn judge_config_default() {
        let cfg = JudgeConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(cfg.worker.workers, 5);
        assert_eq!(cfg.queue.capacity, 1024);
        assert_eq!(cfg.queue.overflow, QueueOverflow::Reject);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn liveness_timeout_adds_grace() {
        let cfg = JudgeConfig::default();
        assert_eq!(cfg.liveness_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn validate_rejects_zero_workers_and_capacity() {
        assert!(JudgeConfig::default().with_workers(0).validate().is_err());
        assert!(JudgeConfig::default()
            .with_queue(0, QueueOverflow::Block)
            .validate()
            .is_err());
    }

    #[test]
    fn validate_rejects_empty_interpreter() {
        let mut cfg = JudgeConfig::default();
        cfg.sandbox.interpreter.clear();
        assert!(matches!(cfg.validate(), Err(JudgeError::Validation(_))));
    }
}
