//! CLI command definitions for job-forge.
//!
//! `serve` runs the engine in the foreground; every other command opens the
//! configured store, performs one operation and prints JSON on stdout.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::Engine;

/// Reliable job execution engine.
#[derive(Parser)]
#[command(name = "job-forge")]
#[command(about = "Run and manage durable background jobs")]
#[command(version)]
#[command(
    long_about = "job-forge executes failure-prone jobs with retries, a dead-letter queue, circuit breakers and graceful degradation.\n\nExample usage:\n  job-forge serve --workers 4\n  job-forge submit echo --params '{\"hello\":\"world\"}'\n  job-forge status <job_id>"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Job store URL (sqlite://… or redis://…).
    #[arg(long, global = true, env = "JOB_FORGE_DATABASE_URL")]
    pub database_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run workers, the reconciler and health monitoring until Ctrl-C.
    Serve(ServeArgs),

    /// Submit a job.
    Submit(SubmitArgs),

    /// Show a job's record.
    Status {
        job_id: Uuid,
    },

    /// Request cancellation of a job.
    Cancel {
        job_id: Uuid,
    },

    /// Show queue, running-job and dead-letter statistics.
    Stats,

    /// Run the component health checks; fails when the store or the
    /// runtime is unhealthy.
    Health,

    /// Inspect and replay the dead-letter queue.
    #[command(subcommand)]
    Dlq(DlqCommand),
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Number of workers to start with.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// YAML file with per-target breaker, fallback and throttle policies.
    #[arg(long)]
    pub policies: Option<PathBuf>,

    /// Disable resource-driven autoscaling.
    #[arg(long)]
    pub no_autoscale: bool,
}

#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Registered task name.
    pub task: String,

    /// Task params as a JSON object.
    #[arg(short, long, default_value = "{}")]
    pub params: String,

    /// Higher runs first (0-1000).
    #[arg(long, default_value = "0")]
    pub priority: i32,

    /// Hard timeout in seconds (defaults to JOB_FORGE_DEFAULT_TIMEOUT_SECS).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Retries before dead-lettering (defaults to JOB_FORGE_DEFAULT_MAX_RETRIES).
    #[arg(long)]
    pub max_retries: Option<u32>,
}

#[derive(clap::Subcommand, Debug)]
pub enum DlqCommand {
    /// List dead-lettered jobs, newest first.
    List {
        #[arg(long, default_value = "0")]
        start: usize,
        #[arg(long, default_value = "20")]
        count: usize,
    },

    /// Re-enqueue a dead-lettered job.
    Replay {
        job_id: Uuid,
        /// Keep the retry count instead of resetting it to 0.
        #[arg(long)]
        keep_retries: bool,
    },

    /// Dead-letter queue statistics.
    Stats,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env().context("invalid JOB_FORGE_* configuration")?;
    if let Some(url) = cli.database_url {
        config = config.with_database_url(url);
    }

    match cli.command {
        Commands::Serve(args) => run_serve_command(config, args).await,
        Commands::Submit(args) => run_submit_command(config, args).await,
        Commands::Status { job_id } => {
            let engine = open_engine(config).await?;
            print_json(&engine.get_job_status(job_id).await?)
        }
        Commands::Cancel { job_id } => {
            let engine = open_engine(config).await?;
            let cancelled = engine.cancel_job(job_id).await?;
            print_json(&serde_json::json!({ "job_id": job_id, "cancelled": cancelled }))
        }
        Commands::Stats => {
            let engine = open_engine(config).await?;
            print_json(&serde_json::json!({
                "jobs": engine.manager().get_stats().await?,
                "dead_letter": engine.dlq_stats().await?,
            }))
        }
        Commands::Health => {
            let engine = open_engine(config).await?;
            let readiness = engine.readiness().await;
            print_json(&readiness)?;
            if !readiness.ready_for_traffic {
                let failed: Vec<&str> =
                    readiness.failed_components.iter().map(|c| c.as_str()).collect();
                anyhow::bail!(
                    "engine not ready (status {}, failed: {})",
                    readiness.status.as_str(),
                    failed.join(", ")
                );
            }
            Ok(())
        }
        Commands::Dlq(command) => run_dlq_command(config, command).await,
    }
}

/// Opens the store behind an engine that is never started.
async fn open_engine(config: EngineConfig) -> anyhow::Result<Engine> {
    Engine::builder(config)
        .without_metrics()
        .build()
        .await
        .context("failed to open the job store")
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize output: {}", e))?;
    println!("{}", json);
    Ok(())
}

async fn run_serve_command(mut config: EngineConfig, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        let max_workers = config.max_workers.max(workers);
        config = config.with_workers(workers, max_workers);
    }
    if let Some(path) = args.policies {
        config = config.with_policies_file(path);
    }
    if args.no_autoscale {
        config = config.with_autoscale(false);
    }

    let engine = Engine::builder(config).build().await?;
    engine.start().await?;
    info!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C");

    let shutdown = engine.shutdown().await;
    let pool = engine.pool_stats();
    info!(
        completed = pool.jobs_completed,
        failed = pool.jobs_failed,
        cancelled = pool.jobs_cancelled,
        success_rate = pool.success_rate(),
        "Final pool statistics"
    );
    shutdown?;
    Ok(())
}

async fn run_submit_command(config: EngineConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let params: Value = serde_json::from_str(&args.params)
        .with_context(|| format!("--params is not valid JSON: {}", args.params))?;

    let engine = open_engine(config).await?;
    let mut job = engine
        .new_job(&args.task)
        .with_params(params)
        .with_priority(args.priority);
    if let Some(timeout) = args.timeout {
        job = job.with_timeout_seconds(timeout);
    }
    if let Some(retries) = args.max_retries {
        job = job.with_max_retries(retries);
    }

    let job_id = engine.submit_job(job).await?;
    print_json(&serde_json::json!({ "job_id": job_id, "task_name": args.task }))
}

async fn run_dlq_command(config: EngineConfig, command: DlqCommand) -> anyhow::Result<()> {
    let engine = open_engine(config).await?;
    match command {
        DlqCommand::List { start, count } => {
            print_json(&engine.list_dead_letter(start, count).await?)
        }
        DlqCommand::Replay {
            job_id,
            keep_retries,
        } => print_json(&engine.replay_dead_letter(job_id, !keep_retries).await?),
        DlqCommand::Stats => print_json(&engine.dlq_stats().await?),
    }
}
