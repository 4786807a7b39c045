//! Command-line interface for callflow.
//!
//! Exposes the boundary operations (create, show, search, upload, download,
//! requeue) plus the analysis worker and queue inspection. Entities are
//! printed as pretty JSON; failures of boundary operations are printed as a
//! JSON error object on stderr with an exit code per error kind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::config::{self, paths, Settings};
use crate::core::{CallService, CallStore, ErrorKind, ServiceError, DEFAULT_PAGE_SIZE};
use crate::ingest::{build_analyzer, JsonlTaskQueue, TaskQueue, WorkerPool};

/// callflow - call recording ingestion and analysis
#[derive(Parser, Debug)]
#[command(name = "callflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the state directories and database
    Init {
        /// Also write a starter .callflow/config.yaml in the current directory
        #[arg(long)]
        write_config: bool,
    },

    /// Create a call
    Create {
        /// Caller number (E.164, e.g. +79001234567)
        caller: String,

        /// Receiver number
        receiver: String,

        /// Call start (RFC 3339); defaults to now
        #[arg(long)]
        started_at: Option<DateTime<Utc>>,
    },

    /// Show a call and its recording
    Show {
        call_id: Uuid,
    },

    /// Search calls by caller/receiver substring
    Search {
        /// Text to match (empty matches everything)
        #[arg(default_value = "")]
        query: String,

        #[arg(short, long, default_value_t = DEFAULT_PAGE_SIZE)]
        limit: u32,

        #[arg(short, long, default_value_t = 0)]
        offset: u64,
    },

    /// Upload a recording for a call (.mp3 or .wav)
    Upload {
        call_id: Uuid,

        /// Audio file, or "-" for stdin
        file: PathBuf,

        /// Original filename (required when reading stdin)
        #[arg(long)]
        name: Option<String>,
    },

    /// Print a presigned download URL for a call's recording
    Download {
        call_id: Uuid,

        /// URL lifetime in seconds (defaults to object_storage.presign_expiry_seconds)
        #[arg(long)]
        expires: Option<u64>,
    },

    /// Re-enqueue analysis for calls stuck in processing
    Requeue {
        /// Call to re-queue
        #[arg(required_unless_present = "all")]
        call_id: Option<Uuid>,

        /// Every processing call without an active job
        #[arg(long, conflicts_with = "call_id")]
        all: bool,

        /// Cap on calls scanned with --all
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },

    /// Run analysis workers
    Worker {
        /// Drain the currently deliverable jobs and exit
        #[arg(long)]
        once: bool,

        /// Number of workers (overrides worker.concurrency)
        #[arg(short, long, env = "CALLFLOW_WORKER_CONCURRENCY")]
        concurrency: Option<usize>,
    },

    /// Show task queue status
    Queue,

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let settings = config::load()?;

        match self.command {
            Commands::Init { write_config } => init(&settings, write_config).await,
            Commands::Config => show_config(&settings),
            Commands::Queue => show_queue(&settings).await,
            Commands::Worker { once, concurrency } => {
                run_worker(&settings, once, concurrency).await
            }
            command => {
                let service = CallService::from_settings(&settings)
                    .await
                    .context("Failed to open call service")?;
                match run_boundary(&service, command).await? {
                    Ok(value) => print_json(&value),
                    Err(err) => report(&err),
                }
            }
        }
    }
}

/// Boundary operations; the outer `Result` is a local setup failure, the
/// inner one the operation's own error
async fn run_boundary(
    service: &CallService,
    command: Commands,
) -> Result<Result<Value, ServiceError>> {
    let result = match command {
        Commands::Create {
            caller,
            receiver,
            started_at,
        } => service
            .create_call(&caller, &receiver, started_at.unwrap_or_else(Utc::now))
            .map(|call| json!(call)),
        Commands::Show { call_id } => service.get_call(call_id).map(|view| json!(view)),
        Commands::Search {
            query,
            limit,
            offset,
        } => service
            .search_calls(&query, limit, offset)
            .map(|page| json!(page)),
        Commands::Upload {
            call_id,
            file,
            name,
        } => {
            let (original_name, mut source) = open_upload(&file, name).await?;
            service
                .upload_recording(call_id, &original_name, &mut source)
                .await
                .map(|handle| json!(handle))
        }
        Commands::Download { call_id, expires } => service
            .download_url(call_id, expires.map(Duration::from_secs))
            .await
            .map(|link| json!(link)),
        Commands::Requeue {
            call_id: Some(call_id),
            all: false,
            ..
        } => service.requeue(call_id).await.map(|outcome| json!(outcome)),
        Commands::Requeue { limit, .. } => service.requeue_stuck(limit).await.map(|outcomes| {
            outcomes
                .into_iter()
                .map(|(call_id, outcome)| json!({ "call_id": call_id, "outcome": outcome }))
                .collect()
        }),
        other => anyhow::bail!("{:?} is not a call operation", other),
    };

    Ok(result)
}

/// Resolve the original filename and open the upload source
async fn open_upload(
    file: &Path,
    name: Option<String>,
) -> Result<(String, Box<dyn AsyncRead + Send + Unpin>)> {
    let from_stdin = file.as_os_str() == "-";

    let original_name = match name {
        Some(name) => name,
        None if from_stdin => anyhow::bail!("--name is required when reading from stdin"),
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("No file name in {}", file.display()))?,
    };

    let source: Box<dyn AsyncRead + Send + Unpin> = if from_stdin {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(file)
                .await
                .with_context(|| format!("Failed to open {}", file.display()))?,
        )
    };

    Ok((original_name, source))
}

/// Print a boundary error as JSON on stderr and exit with a per-kind code
fn report(err: &ServiceError) -> ! {
    let kind = err.kind();
    let body = json!({
        "error": err.code(),
        "kind": kind,
        "message": err.to_string(),
    });
    eprintln!(
        "{}",
        serde_json::to_string_pretty(&body).unwrap_or_else(|_| err.to_string())
    );

    let code = match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Validation => 2,
        ErrorKind::Conflict => 3,
        ErrorKind::NotFound => 4,
        ErrorKind::NotImplemented => 5,
    };
    std::process::exit(code)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

/// Create state directories and migrate the database
async fn init(settings: &Settings, write_config: bool) -> Result<()> {
    for dir in [&settings.home, &settings.recordings_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let store = CallStore::open(&settings.database)
        .with_context(|| format!("Failed to open database {}", settings.database.display()))?;
    JsonlTaskQueue::open(&settings.queue_path, settings.queue.clone()).await?;

    println!("Home:       {}", settings.home.display());
    println!("Database:   {} (schema v{})", settings.database.display(), store.schema_version()?);
    println!("Recordings: {}", settings.recordings_dir.display());
    println!("Queue:      {}", settings.queue_path.display());

    if write_config {
        let dir = std::env::current_dir()?.join(paths::CONFIG_DIR);
        let path = dir.join(paths::CONFIG_FILE);
        if path.exists() {
            println!("Config:     {} (exists, left unchanged)", path.display());
        } else {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, STARTER_CONFIG)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Config:     {} (written)", path.display());
        }
    }

    Ok(())
}

const STARTER_CONFIG: &str = r#"version: "1"

# paths:
#   home: state              # relative to this .callflow/ directory
#   database: data/callflow.db
#   recordings: data/recordings
#   queue: data/jobs.jsonl

queue:
  lease_seconds: 300
  max_attempts: 5
  retry_backoff_seconds: 10
  poll_interval_ms: 1000

worker:
  concurrency: 1
  job_timeout_seconds: 120

analysis:
  transcriber: sample          # or: whisper
  transcript_sample_seconds: 20
  silence_window_seconds: 5

object_storage:
  enabled: false
  # endpoint_url: http://localhost:9000
  # bucket: recordings
  # region: us-east-1
  # credentials via S3_ACCESS_KEY / S3_SECRET_KEY
"#;

/// Run the worker pool until Ctrl+C, or drain once
async fn run_worker(settings: &Settings, once: bool, concurrency: Option<usize>) -> Result<()> {
    // One store connection per worker process, opened here
    let store = Arc::new(
        CallStore::open(&settings.database)
            .with_context(|| format!("Failed to open database {}", settings.database.display()))?,
    );
    let queue: Arc<dyn TaskQueue> =
        Arc::new(JsonlTaskQueue::open(&settings.queue_path, settings.queue.clone()).await?);
    let analyzer = build_analyzer(&settings.analysis);

    let mut worker_config = settings.worker.clone();
    if let Some(n) = concurrency {
        worker_config.concurrency = n;
    }

    let pool = WorkerPool::new(
        store,
        queue,
        analyzer,
        &worker_config,
        settings.queue.poll_interval(),
    );

    if once {
        let outcomes = pool.drain().await;
        print_json(&outcomes)?;
        return Ok(());
    }

    // Set up Ctrl+C handler
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown requested, finishing in-flight jobs");
        let _ = stop_tx.send(true);
    });

    let handled = pool.run(stop_rx).await?;
    eprintln!("Worker pool stopped after {} job(s)", handled);
    Ok(())
}

async fn show_queue(settings: &Settings) -> Result<()> {
    let queue = JsonlTaskQueue::open(&settings.queue_path, settings.queue.clone()).await?;
    let status = queue.status().await?;
    print_json(&status)?;
    Ok(())
}

fn show_config(settings: &Settings) -> Result<()> {
    println!(
        "Config file: {}",
        settings
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:       {}", settings.home.display());
    println!("  Database:   {}", settings.database.display());
    println!("  Recordings: {}", settings.recordings_dir.display());
    println!("  Queue:      {}", settings.queue_path.display());
    println!();
    println!("Queue:");
    println!("  Lease:          {}s", settings.queue.lease_seconds);
    println!("  Max attempts:   {}", settings.queue.max_attempts);
    println!("  Retry backoff:  {}s (doubling)", settings.queue.retry_backoff_seconds);
    println!("  Poll interval:  {}ms", settings.queue.poll_interval_ms);
    println!();
    println!("Worker:");
    println!("  Concurrency:    {}", settings.worker.concurrency);
    println!("  Job timeout:    {}s", settings.worker.job_timeout_seconds);
    println!();
    println!("Analysis:");
    println!("  Transcriber:    {:?}", settings.analysis.transcriber);
    println!();
    println!("Object storage: {:?}", settings.object_storage);

    Ok(())
}
