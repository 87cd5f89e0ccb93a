use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use orbit_judge::client::JudgeClient;
use orbit_judge::config::{
    JudgeConfig, QueueConfig, QueueOverflow, SandboxBackend, SandboxConfig, WorkerConfig,
};
use orbit_judge::judge::Judge;
use orbit_judge::service::JobView;
use orbit_judge::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "orbit-judge")]
#[command(version)]
#[command(about = "Asynchronous sandboxed code-execution judge")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the judge server
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the HTTP API to
    #[arg(long, env = "ORBIT_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Port for the HTTP API
    #[arg(long, env = "ORBIT_PORT", default_value = "8080")]
    port: u16,

    /// Number of concurrent workers
    #[arg(long, env = "ORBIT_WORKERS", default_value = "5")]
    workers: usize,

    /// Wall-clock limit per job in milliseconds
    #[arg(long, env = "ORBIT_TIME_LIMIT_MS", default_value = "5000")]
    time_limit_ms: u64,

    /// Maximum number of queued jobs
    #[arg(long, env = "ORBIT_QUEUE_CAPACITY", default_value = "1024")]
    queue_capacity: usize,

    /// What to do when the queue is full
    #[arg(long, env = "ORBIT_QUEUE_OVERFLOW", value_enum, default_value = "reject")]
    overflow: QueueOverflow,

    /// How long a submission may wait for queue space with --overflow=block
    #[arg(long, env = "ORBIT_ENQUEUE_TIMEOUT_MS", default_value = "1000")]
    enqueue_timeout_ms: u64,

    /// Per-stream output capture limit in bytes
    #[arg(long, env = "ORBIT_MAX_OUTPUT_BYTES", default_value = "65536")]
    max_output_bytes: usize,

    /// Maximum source size in bytes
    #[arg(long, env = "ORBIT_MAX_CODE_BYTES", default_value = "65536")]
    max_code_bytes: usize,

    /// Sandbox backend
    #[arg(long, env = "ORBIT_SANDBOX_BACKEND", value_enum, default_value = "docker")]
    backend: SandboxBackend,

    /// Docker image to use for job execution
    #[arg(long, env = "ORBIT_SANDBOX_IMAGE", default_value = "python:3.12-alpine")]
    image: String,

    /// Interpreter command, whitespace separated
    #[arg(long, env = "ORBIT_INTERPRETER", default_value = "python3 -I -B")]
    interpreter: String,

    /// Memory limit per job in MiB (0 disables)
    #[arg(long, env = "ORBIT_MEMORY_LIMIT_MB", default_value = "128")]
    memory_limit_mb: u64,

    /// Seconds in-flight jobs get to finish on shutdown
    #[arg(long, env = "ORBIT_DRAIN_TIMEOUT_SECS", default_value = "30")]
    drain_timeout_secs: u64,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', env = "ORBIT_ADDR", default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit code for judging
    Submit {
        /// Source code (use --file to read it from disk instead)
        #[arg(required_unless_present = "file")]
        code: Option<String>,

        /// Read the source code from a file
        #[arg(long, short = 'f', conflicts_with = "code")]
        file: Option<PathBuf>,

        /// Output the program is expected to print
        #[arg(long, short = 'e', default_value = "")]
        expected: String,

        /// Poll until the job reaches a terminal state
        #[arg(long, short = 'w')]
        wait: bool,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: String,

        /// Poll until the job reaches a terminal state
        #[arg(long, short = 'w')]
        wait: bool,
    },
}

/// How often `--wait` polls the server
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Upper bound for `--wait`
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Server Implementation
// =============================================================================

fn build_config(args: ServerArgs) -> Result<JudgeConfig, Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    let sandbox = SandboxConfig {
        backend: args.backend,
        image: args.image,
        interpreter: args.interpreter.split_whitespace().map(String::from).collect(),
        memory_limit_mb: (args.memory_limit_mb > 0).then_some(args.memory_limit_mb),
        time_limit: Duration::from_millis(args.time_limit_ms),
        max_output_bytes: args.max_output_bytes,
        ..SandboxConfig::default()
    };

    Ok(JudgeConfig {
        listen_addr,
        max_code_bytes: args.max_code_bytes,
        queue: QueueConfig {
            capacity: args.queue_capacity,
            overflow: args.overflow,
            enqueue_timeout: Duration::from_millis(args.enqueue_timeout_ms),
        },
        worker: WorkerConfig {
            workers: args.workers,
            drain_timeout: Duration::from_secs(args.drain_timeout_secs),
            ..WorkerConfig::default()
        },
        sandbox,
    })
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = build_config(args)?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        workers = config.worker.workers,
        backend = %config.sandbox.backend,
        image = %config.sandbox.image,
        time_limit_ms = config.sandbox.time_limit.as_millis() as u64,
        queue_capacity = config.queue.capacity,
        overflow = ?config.queue.overflow,
        "Starting orbit-judge"
    );

    let shutdown = install_shutdown_handler()?;
    let judge = Judge::new(config)?;
    judge.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn print_job(view: &JobView, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(view)?);
        }
        OutputFormat::Table => {
            println!("Job ID:      {}", view.job_id);
            println!("Status:      {}", view.status);
            if let Some(verdict) = view.verdict {
                println!("Verdict:     {}", verdict);
            }
            if let Some(exit_code) = view.exit_code {
                println!("Exit Code:   {}", exit_code);
            }
            if let Some(worker) = view.executed_by {
                println!("Executed By: worker {}", worker);
            }
            if let (Some(started), Some(completed)) = (view.started_at, view.completed_at) {
                let ms = (completed - started).num_milliseconds();
                println!("Duration:    {} ms", ms);
            }
            if let Some(ref output) = view.actual_output {
                println!("Output:");
                for line in output.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_submit(
    client: &JudgeClient,
    code: String,
    expected: String,
    wait: bool,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job_id = match client.submit(&code, &expected).await {
        Ok(job_id) => job_id,
        Err(e) => {
            eprintln!("Error: Job submission failed: {}", e);
            if e.is_retryable() {
                eprintln!("Hint: the judge is saturated, retry in a moment");
            }
            std::process::exit(1);
        }
    };

    if wait {
        let view = client.wait_for(&job_id, POLL_INTERVAL, WAIT_TIMEOUT).await?;
        return print_job(&view, output_format);
    }

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "job_id": job_id }));
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", job_id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &JudgeClient,
    job_id: String,
    wait: bool,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job_id: Uuid = job_id.parse()?;
    let view = if wait {
        client.wait_for(&job_id, POLL_INTERVAL, WAIT_TIMEOUT).await?
    } else {
        client.status(&job_id).await?
    };
    print_job(&view, output_format)
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let judge_client = JudgeClient::new(client.addr.clone());

            match command {
                JobCommands::Submit {
                    code,
                    file,
                    expected,
                    wait,
                } => {
                    let code = match file {
                        Some(path) => tokio::fs::read_to_string(path).await?,
                        None => code.unwrap_or_default(),
                    };
                    handle_job_submit(&judge_client, code, expected, wait, &client.output).await?;
                }
                JobCommands::Status { job_id, wait } => {
                    handle_job_status(&judge_client, job_id, wait, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
