use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::config::{SandboxBackend, SandboxConfig};
use crate::error::{JudgeError, Result};

/// Mount point of the scratch directory inside containers
const CONTAINER_WORKDIR: &str = "/sandbox";
/// Unprivileged uid:gid the container runs as
const CONTAINER_USER: &str = "65534:65534";
/// Docker CLI exit codes that mean the container never ran the code:
/// 125 daemon error, 126 command not executable, 127 command not found
const DOCKER_FAILURE_CODES: [i32; 3] = [125, 126, 127];
/// Upper bound for `docker create`, `docker rm` and `docker image inspect`
const DOCKER_CLI_TIMEOUT: Duration = Duration::from_secs(30);
const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(600);
const PROCESS_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const MAX_OPEN_FILES: u64 = 64;
/// Largest file the submitted program may write into its scratch dir
const MAX_FILE_SIZE: u64 = 1024 * 1024;
/// How long to wait for pipes to drain once the process is gone
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 8 * 1024;

/// Raw result of running one submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxOutcome {
    pub exit_code: Option<i32>,
    /// Signal that terminated the process, if any
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub timed_out: bool,
    /// Set when the sandbox itself failed; the code may never have run
    pub spawn_error: Option<String>,
    pub elapsed: Duration,
}

impl SandboxOutcome {
    fn sandbox_failure(error: String, elapsed: Duration) -> Self {
        Self {
            spawn_error: Some(error),
            elapsed,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Written by the reader task, taken by `collect`. Shared so that bytes
/// already read survive a reader that has to be abandoned.
type SharedCapture = Arc<Mutex<Captured>>;

fn lock(capture: &SharedCapture) -> MutexGuard<'_, Captured> {
    capture.lock().unwrap_or_else(PoisonError::into_inner)
}

enum ExitReason {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
}

/// Runs untrusted code out of process with a wall-clock limit, bounded
/// output capture, and a hard kill on expiry.
///
/// With the docker backend every job gets a throwaway container with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities and no-new-privileges
/// - Read-only root filesystem, code mounted read-only
/// - Memory, CPU and process-count limits
///
/// The container is created first and only started under the clock, so
/// container setup is never charged to the submission.
///
/// The process backend only scrubs the environment, confines the working
/// directory to scratch space and applies rlimits.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Make sure jobs can start without first-use delays. For docker this
    /// pulls the image if it is not present locally.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError::Sandbox` if the image is missing and cannot be
    /// pulled.
    pub async fn prepare(&self) -> Result<()> {
        if self.config.backend != SandboxBackend::Docker {
            return Ok(());
        }
        let image = &self.config.image;

        let inspect = self
            .docker_output(&["image", "inspect", image.as_str()], DOCKER_CLI_TIMEOUT)
            .await;
        if matches!(inspect, Ok(ref output) if output.status.success()) {
            tracing::info!(image = %image, "Sandbox image present");
            return Ok(());
        }

        tracing::info!(image = %image, "Pulling sandbox image");
        match self.docker_output(&["pull", image.as_str()], IMAGE_PULL_TIMEOUT).await {
            Ok(output) if output.status.success() => {
                tracing::info!(image = %image, "Sandbox image pulled");
                Ok(())
            }
            Ok(output) => Err(JudgeError::Sandbox(format!(
                "failed to pull image {}: {}",
                image,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            Err(e) => Err(JudgeError::Sandbox(format!("failed to pull image {}: {}", image, e))),
        }
    }

    /// Execute `code` and report what happened. Never returns an error:
    /// infrastructure failures are reported through `spawn_error`.
    pub async fn run(&self, job_id: Uuid, code: &str) -> SandboxOutcome {
        let started = Instant::now();
        tracing::info!(
            job_id = %job_id,
            backend = %self.config.backend,
            time_limit_ms = self.config.time_limit.as_millis() as u64,
            "Executing job"
        );

        let scratch = match self.prepare_scratch(code).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to prepare scratch directory");
                return SandboxOutcome::sandbox_failure(
                    format!("failed to prepare scratch directory: {}", e),
                    started.elapsed(),
                );
            }
        };

        let container = format!("orbit-judge-{}", job_id.simple());
        let mut reaper = Reaper {
            pid: None,
            container: None,
        };

        let command = match self.config.backend {
            SandboxBackend::Docker => {
                // Armed before create so an abort mid-create still removes it
                reaper.container = Some((self.config.docker_binary.clone(), container.clone()));
                if let Err(e) = self.create_container(scratch.path(), &container).await {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to create container");
                    self.remove_container(&container).await;
                    reaper.disarm();
                    return SandboxOutcome::sandbox_failure(e, started.elapsed());
                }
                self.start_command(&container)
            }
            SandboxBackend::Process => self.process_command(scratch.path()),
        };

        let outcome = self.supervise(job_id, command, &container, &mut reaper).await;

        tracing::info!(
            job_id = %job_id,
            exit_code = ?outcome.exit_code,
            timed_out = outcome.timed_out,
            run_ms = outcome.elapsed.as_millis() as u64,
            total_ms = started.elapsed().as_millis() as u64,
            "Execution finished"
        );
        // scratch is removed when dropped here
        outcome
    }

    async fn prepare_scratch(&self, code: &str) -> std::io::Result<tempfile::TempDir> {
        let dir = tempfile::Builder::new().prefix("orbit-job-").tempdir()?;
        let source = dir.path().join(&self.config.source_file);
        tokio::fs::write(&source, code).await?;

        if self.config.backend == SandboxBackend::Docker {
            // The container user is not the owner of the bind mount
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).await?;
            tokio::fs::set_permissions(&source, std::fs::Permissions::from_mode(0o644)).await?;
        }
        Ok(dir)
    }

    fn create_command(&self, scratch: &Path, container: &str) -> std::process::Command {
        let cfg = &self.config;
        let mut cmd = std::process::Command::new(&cfg.docker_binary);
        cmd.arg("create").arg("--rm").arg(format!("--name={}", container));

        if cfg.network_disabled {
            cmd.arg("--network=none");
        }
        if let Some(mb) = cfg.memory_limit_mb {
            cmd.arg(format!("--memory={}m", mb));
            cmd.arg(format!("--memory-swap={}m", mb));
        }
        if let Some(ref limit) = cfg.cpu_limit {
            cmd.arg(format!("--cpus={}", limit));
        }
        if let Some(pids) = cfg.pids_limit {
            cmd.arg(format!("--pids-limit={}", pids));
        }

        cmd.args([
            "--cap-drop=ALL",
            "--security-opt=no-new-privileges",
            "--read-only",
            "--tmpfs=/tmp:rw,noexec,nosuid,size=16m",
        ]);
        cmd.arg(format!("--user={}", CONTAINER_USER));
        cmd.arg(format!(
            "--volume={}:{}:ro",
            scratch.display(),
            CONTAINER_WORKDIR
        ));
        cmd.arg(format!("--workdir={}", CONTAINER_WORKDIR));

        cmd.arg(&cfg.image);
        cmd.args(&cfg.interpreter);
        cmd.arg(format!("{}/{}", CONTAINER_WORKDIR, cfg.source_file));
        cmd
    }

    fn start_command(&self, container: &str) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.config.docker_binary);
        cmd.args(["start", "--attach", container]);
        cmd
    }

    fn process_command(&self, scratch: &Path) -> std::process::Command {
        let cfg = &self.config;
        let mut parts = cfg.interpreter.iter();
        let program = parts.next().map(String::as_str).unwrap_or("python3");

        let mut cmd = std::process::Command::new(program);
        cmd.args(parts)
            .arg(scratch.join(&cfg.source_file))
            .current_dir(scratch)
            .env_clear()
            .env("PATH", PROCESS_PATH)
            .env("HOME", scratch)
            .env("TMPDIR", scratch)
            .env("LANG", "C.UTF-8");

        let address_space = cfg.memory_limit_mb.map(|mb| mb * 1024 * 1024);
        // SAFETY: the hook only issues setrlimit syscalls, which are
        // async-signal-safe, and allocates nothing.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(bytes) = address_space {
                    setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
                }
                setrlimit(Resource::RLIMIT_FSIZE, MAX_FILE_SIZE, MAX_FILE_SIZE)?;
                setrlimit(Resource::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES)?;
                Ok(())
            });
        }
        cmd
    }

    async fn create_container(&self, scratch: &Path, container: &str) -> std::result::Result<(), String> {
        let mut command = Command::from(self.create_command(scratch, container));
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(DOCKER_CLI_TIMEOUT, command.output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(format!(
                "docker create failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            Ok(Err(e)) => Err(format!("failed to run {}: {}", self.config.docker_binary, e)),
            Err(_) => Err(format!("docker create timed out after {:?}", DOCKER_CLI_TIMEOUT)),
        }
    }

    async fn supervise(
        &self,
        job_id: Uuid,
        mut command: std::process::Command,
        container: &str,
        reaper: &mut Reaper,
    ) -> SandboxOutcome {
        // Own process group so a kill reaches everything the code spawned
        command
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let program = command.get_program().to_string_lossy().into_owned();
        let mut command = Command::from(command);
        command.kill_on_drop(true);

        // The clock starts here, after any container setup
        let started = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %job_id, program, error = %e, "Failed to spawn sandbox");
                return SandboxOutcome::sandbox_failure(
                    format!("failed to spawn {}: {}", program, e),
                    started.elapsed(),
                );
            }
        };
        let pid = child.id();
        reaper.pid = pid;

        let limit = self.config.max_output_bytes;
        let stdout_buf = SharedCapture::default();
        let stderr_buf = SharedCapture::default();
        let stdout_task = tokio::spawn(read_bounded(child.stdout.take(), limit, stdout_buf.clone()));
        let stderr_task = tokio::spawn(read_bounded(child.stderr.take(), limit, stderr_buf.clone()));

        let exit_reason = tokio::select! {
            result = wait_and_kill_group(&mut child, pid) => match result {
                Ok(status) => ExitReason::Exited(status),
                Err(e) => ExitReason::WaitFailed(e),
            },
            _ = tokio::time::sleep(self.config.time_limit) => ExitReason::TimedOut,
        };

        let mut outcome = SandboxOutcome::default();
        match exit_reason {
            ExitReason::Exited(status) => {
                outcome.exit_code = status.code();
                outcome.signal = status.signal();
            }
            ExitReason::WaitFailed(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Waiting on sandbox failed");
                self.hard_kill(pid, &mut child, container).await;
                outcome.spawn_error = Some(format!("failed to wait for {}: {}", program, e));
            }
            ExitReason::TimedOut => {
                tracing::warn!(
                    job_id = %job_id,
                    time_limit_ms = self.config.time_limit.as_millis() as u64,
                    "Time limit exceeded, killing sandbox"
                );
                self.hard_kill(pid, &mut child, container).await;
                outcome.timed_out = true;
            }
        }
        reaper.disarm();

        let (stdout, stderr) = tokio::join!(
            collect(job_id, "stdout", stdout_task, stdout_buf),
            collect(job_id, "stderr", stderr_task, stderr_buf),
        );
        outcome.stdout = String::from_utf8_lossy(&stdout.bytes).into_owned();
        outcome.stderr = String::from_utf8_lossy(&stderr.bytes).into_owned();
        outcome.stdout_truncated = stdout.truncated;
        outcome.stderr_truncated = stderr.truncated;
        outcome.elapsed = started.elapsed();

        let docker_failed = outcome
            .exit_code
            .is_some_and(|code| DOCKER_FAILURE_CODES.contains(&code));
        if self.config.backend == SandboxBackend::Docker && docker_failed && outcome.spawn_error.is_none() {
            tracing::error!(
                job_id = %job_id,
                exit_code = ?outcome.exit_code,
                stderr = %outcome.stderr.trim(),
                "Docker could not run the submission"
            );
            outcome.spawn_error = Some(format!(
                "docker could not run the submission (exit {}): {}",
                outcome.exit_code.unwrap_or(-1),
                outcome.stderr.trim()
            ));
        }
        outcome
    }

    /// SIGKILL, not a polite request: the code is untrusted.
    async fn hard_kill(&self, pid: Option<u32>, child: &mut Child, container: &str) {
        if self.config.backend == SandboxBackend::Docker {
            // Killing the CLI alone would leave the container running
            self.remove_container(container).await;
        }
        kill_group(pid);
        if let Err(e) = child.kill().await {
            tracing::debug!(error = %e, "Child already gone");
        }
    }

    async fn remove_container(&self, container: &str) {
        match self
            .docker_output(&["rm", "--force", container], DOCKER_CLI_TIMEOUT)
            .await
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => tracing::debug!(
                container,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "docker rm reported an error"
            ),
            Err(e) => tracing::warn!(container, error = %e, "docker rm failed"),
        }
    }

    async fn docker_output(&self, args: &[&str], timeout: Duration) -> std::io::Result<std::process::Output> {
        let mut command = Command::new(&self.config.docker_binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("docker {} timed out after {:?}", args.join(" "), timeout),
                )
            })?
    }
}

/// Kills the job if `supervise` is dropped before it has, e.g. when a worker
/// is aborted at the end of a drain. `kill_on_drop` alone only reaches the
/// direct child.
struct Reaper {
    pid: Option<u32>,
    /// docker binary and container name
    container: Option<(String, String)>,
}

impl Reaper {
    fn disarm(&mut self) {
        self.pid = None;
        self.container = None;
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        kill_group(self.pid);
        let Some((docker, container)) = self.container.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let mut command = Command::new(&docker);
                    command
                        .args(["rm", "--force", container.as_str()])
                        .stdin(Stdio::null())
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .kill_on_drop(true);
                    match tokio::time::timeout(DOCKER_CLI_TIMEOUT, command.status()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::warn!(container = %container, error = %e, "docker rm failed"),
                        Err(_) => tracing::warn!(container = %container, "docker rm timed out"),
                    }
                });
            }
            Err(_) => tracing::warn!(container = %container, "No runtime left to remove container"),
        }
    }
}

fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // ESRCH just means the group is already empty
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

/// Wait for the child, then kill whatever it left running in its group.
///
/// On Linux the leader is left unreaped until the group is killed: a zombie
/// still holds its pid, so the group id cannot be recycled by another job
/// in between.
async fn wait_and_kill_group(child: &mut Child, pid: Option<u32>) -> std::io::Result<ExitStatus> {
    if let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) {
        let parked = tokio::task::spawn_blocking(move || wait_unreaped(raw)).await;
        if matches!(parked, Ok(Ok(()))) {
            kill_group(pid);
            return child.wait().await;
        }
    }
    let status = child.wait().await;
    kill_group(pid);
    status
}

#[cfg(target_os = "linux")]
fn wait_unreaped(pid: i32) -> nix::Result<()> {
    use nix::errno::Errno;
    use nix::sys::wait::{waitid, Id, WaitPidFlag};

    loop {
        match waitid(
            Id::Pid(Pid::from_raw(pid)),
            WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT,
        ) {
            Err(Errno::EINTR) => continue,
            other => return other.map(drop),
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn wait_unreaped(_pid: i32) -> nix::Result<()> {
    Err(nix::errno::Errno::ENOSYS)
}

/// Take what a reader captured. A reader still blocked after
/// `PIPE_DRAIN_TIMEOUT` is abandoned, keeping the bytes it already read.
async fn collect(
    job_id: Uuid,
    stream: &'static str,
    task: tokio::task::JoinHandle<std::io::Result<()>>,
    capture: SharedCapture,
) -> Captured {
    let abort = task.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => {
            tracing::warn!(job_id = %job_id, stream, error = %e, "Reading sandbox output failed");
        }
        Ok(Err(e)) => {
            tracing::warn!(job_id = %job_id, stream, error = %e, "Output reader task failed");
        }
        Err(_) => {
            // Something outside the process group still holds the pipe
            abort.abort();
            tracing::warn!(job_id = %job_id, stream, "Pipe still open after exit, keeping output read so far");
        }
    }
    let captured = std::mem::take(&mut *lock(&capture));
    captured
}

/// Keep the first `limit` bytes and drain the rest so the writer never
/// blocks on a full pipe.
async fn read_bounded<R>(reader: Option<R>, limit: usize, capture: SharedCapture) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };

    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let mut captured = lock(&capture);
        let room = limit.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&buf[..n.min(room)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(data: Option<&[u8]>, limit: usize) -> Captured {
        let capture = SharedCapture::default();
        read_bounded(data, limit, capture.clone()).await.unwrap();
        let captured = std::mem::take(&mut *lock(&capture));
        captured
    }

    #[tokio::test]
    async fn read_bounded_truncates_and_drains() {
        let data = vec![b'x'; 20_000];
        let captured = read_all(Some(&data[..]), 100).await;
        assert_eq!(captured.bytes.len(), 100);
        assert!(captured.truncated);
    }

    #[tokio::test]
    async fn read_bounded_keeps_short_output() {
        let captured = read_all(Some(&b"hello\n"[..]), 100).await;
        assert_eq!(captured.bytes, b"hello\n");
        assert!(!captured.truncated);
    }

    #[tokio::test]
    async fn read_bounded_without_pipe_is_empty() {
        let captured = read_all(None, 100).await;
        assert!(captured.bytes.is_empty());
        assert!(!captured.truncated);
    }

    #[tokio::test]
    async fn collect_keeps_bytes_of_abandoned_reader() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let capture = SharedCapture::default();
        let task = tokio::spawn(read_bounded(Some(reader), 100, capture.clone()));

        tokio::io::AsyncWriteExt::write_all(&mut writer, b"partial").await.unwrap();
        // writer stays open, so the reader never sees EOF
        let captured = collect(Uuid::new_v4(), "stdout", task, capture).await;
        assert_eq!(captured.bytes, b"partial");
        drop(writer);
    }

    #[test]
    fn create_command_applies_isolation_flags() {
        let sandbox = Sandbox::new(SandboxConfig::default());
        let cmd = sandbox.create_command(Path::new("/tmp/scratch"), "orbit-judge-test");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(cmd.get_program(), "docker");
        assert_eq!(args[0], "create");
        for expected in [
            "--rm",
            "--name=orbit-judge-test",
            "--network=none",
            "--memory=128m",
            "--cpus=0.5",
            "--pids-limit=64",
            "--cap-drop=ALL",
            "--security-opt=no-new-privileges",
            "--read-only",
            "--user=65534:65534",
            "--volume=/tmp/scratch:/sandbox:ro",
            "python:3.12-alpine",
            "/sandbox/main.py",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {}", expected);
        }
        // image comes before the interpreter
        let image = args.iter().position(|a| a == "python:3.12-alpine").unwrap();
        assert_eq!(args[image + 1], "python3");
    }

    #[test]
    fn start_command_attaches_to_container() {
        let sandbox = Sandbox::new(SandboxConfig::default());
        let cmd = sandbox.start_command("orbit-judge-test");
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, ["start", "--attach", "orbit-judge-test"]);
    }

    #[test]
    fn process_command_runs_interpreter_in_scratch() {
        let sandbox = Sandbox::new(SandboxConfig::process(&["sh", "-e"], "main.sh"));
        let cmd = sandbox.process_command(Path::new("/tmp/scratch"));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(cmd.get_program(), "sh");
        assert_eq!(args, vec!["-e".to_string(), "/tmp/scratch/main.sh".to_string()]);
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/tmp/scratch")));
    }
}
