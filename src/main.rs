//! queuectl - A persistent shell job queue.
//!
//! Usage:
//!   queuectl enqueue '{"command":"echo hi"}'   Add a job
//!   queuectl worker run                       Process jobs in this process
//!   queuectl worker start --count 3           Start background workers
//!   queuectl worker stop                      Stop background workers
//!   queuectl dlq list | dlq retry <id>        Inspect or requeue dead jobs
//!   queuectl config get | config set <k> <v>  Read or change settings
//!   queuectl status | list --state <state>    Inspect the queue

use clap::{Parser, Subcommand};
use queuectl::supervisor::DEFAULT_PID_FILE;
use queuectl::{
    EventBus, Job, JobId, JobQueue, JobRequest, JobState, ShellExecutor, SqliteStorage,
    Supervisor, TracingHandler, Worker, WorkerHandle,
};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// queuectl - A persistent shell job queue
#[derive(Parser)]
#[command(name = "queuectl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the SQLite queue database
    #[arg(long, global = true, env = "QUEUECTL_DB", default_value = "queue.db")]
    db: PathBuf,

    /// Path to the background worker pid file
    #[arg(long, global = true, env = "QUEUECTL_PID_FILE", default_value = DEFAULT_PID_FILE)]
    pid_file: PathBuf,

    /// Log file, appended to alongside stderr
    #[arg(long, global = true, env = "QUEUECTL_LOG_FILE", default_value = "queuectl.log")]
    log_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a job from a JSON object: {"id"?, "command", "max_retries"?}
    Enqueue {
        #[arg(value_name = "JSON")]
        json: String,
    },

    /// Run or manage workers
    #[command(subcommand)]
    Worker(WorkerCommand),

    /// Inspect and requeue dead jobs
    #[command(subcommand)]
    Dlq(DlqCommand),

    /// Read or change queue settings
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Show job counts per state
    Status,

    /// List jobs, oldest first
    List {
        /// Only show jobs in this state
        #[arg(long)]
        state: Option<JobState>,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Process jobs in the foreground until the queue is idle
    Run {
        /// Kill commands that run longer than this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Start background workers
    Start {
        /// Number of workers to start
        #[arg(short, long, default_value = "1", value_parser = clap::value_parser!(u16).range(1..))]
        count: u16,
    },

    /// Send SIGTERM to background workers
    Stop,
}

#[derive(Subcommand)]
enum DlqCommand {
    /// List dead jobs
    List,

    /// Move a dead job back to pending
    Retry {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print all settings
    Get,

    /// Change a setting
    Set {
        key: String,
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_file);

    match cli.command {
        Commands::Worker(WorkerCommand::Start { count }) => {
            let supervisor = Supervisor::for_current_exe(&cli.db, &cli.pid_file)?
                .with_args([Path::new("--log-file"), cli.log_file.as_path()]);
            let manifest = supervisor.start(usize::from(count))?;
            for pid in &manifest.pids {
                println!("worker started pid={}", pid);
            }
        }
        Commands::Worker(WorkerCommand::Stop) => {
            let supervisor = Supervisor::for_current_exe(&cli.db, &cli.pid_file)?;
            match supervisor.stop()? {
                None => println!("no pid file"),
                Some(report) => {
                    for pid in report.signalled {
                        println!("sent SIGTERM to {}", pid);
                    }
                    for (pid, reason) in report.failed {
                        println!("failed to kill {}: {}", pid, reason);
                    }
                }
            }
        }
        command => {
            let storage = SqliteStorage::new(&cli.db).await?;
            run_command(command, Arc::new(storage)).await?;
        }
    }

    Ok(())
}

/// Run a command that needs the queue database.
async fn run_command(
    command: Commands,
    storage: Arc<SqliteStorage>,
) -> Result<(), Box<dyn std::error::Error>> {
    let queue = JobQueue::with_storage(Arc::clone(&storage));

    match command {
        Commands::Enqueue { json } => {
            let job = queue.enqueue(JobRequest::from_json(&json)?).await?;
            println!("enqueued {}", job.id);
        }
        Commands::Worker(WorkerCommand::Run { timeout }) => {
            run_worker(storage, timeout).await?;
        }
        Commands::Dlq(DlqCommand::List) => {
            print_jobs(&queue.dead_letters().await?)?;
        }
        Commands::Dlq(DlqCommand::Retry { id }) => {
            let job = queue.retry_dead(&JobId::new(id)).await?;
            println!("requeued {}", job.id);
        }
        Commands::Config(ConfigCommand::Get) => {
            for (key, value) in queue.config_get().await? {
                println!("{} = {}", key, value);
            }
        }
        Commands::Config(ConfigCommand::Set { key, value }) => {
            queue.config_set(&key, &value).await?;
            println!("ok");
        }
        Commands::Status => {
            let counts = queue.status().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Commands::List { state } => {
            print_jobs(&queue.list(state).await?)?;
        }
        Commands::Worker(_) => {}
    }

    Ok(())
}

/// Run one worker in this process until it goes idle or is signalled.
async fn run_worker(
    storage: Arc<SqliteStorage>,
    timeout: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let handle = WorkerHandle::new();
    handle.install_signal_handlers()?;

    let event_bus = EventBus::new();
    event_bus.register(Arc::new(TracingHandler)).await;

    let mut executor = ShellExecutor::new();
    if let Some(secs) = timeout {
        executor = executor.with_timeout(Duration::from_secs(secs));
    }

    let worker = Worker::with_storage(Arc::clone(&storage))
        .with_executor(executor)
        .with_event_bus(event_bus);
    let summary = worker.run(handle.token()).await?;

    handle.shutdown();
    storage.close().await;
    info!(worker = worker.name(), processed = summary.processed, "worker exiting");
    Ok(())
}

/// Log to stderr and append plain-text lines to `log_file`.
///
/// A log file that cannot be opened is reported and skipped.
fn init_logging(log_file: &Path) {
    let (file_layer, open_error) = match open_log_file(log_file) {
        Ok(file) => {
            let layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
            (Some(layer), None)
        }
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    if let Some(e) = open_error {
        warn!(path = %log_file.display(), error = %e, "cannot open log file");
    }
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Print jobs as a JSON array.
fn print_jobs(jobs: &[Job]) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(jobs)?);
    Ok(())
}
