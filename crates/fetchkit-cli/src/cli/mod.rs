//! CLI for the fetchkit download engine.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fetchkit_core::config;
use fetchkit_core::store::Store;

use commands::{
    run_add, run_host_limit, run_limit, run_list, run_move, run_pause, run_probe, run_queue,
    run_remove, run_resume, run_scheduler, run_stop,
};

/// Top-level CLI for the fetchkit download engine.
#[derive(Debug, Parser)]
#[command(name = "fetchkit")]
#[command(about = "Resumable multi-connection download manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Add a new download task to the queue.
    Add {
        /// Direct HTTP/HTTPS URL to download.
        url: String,
        /// Directory where the file will be saved (default: current directory).
        #[arg(long, value_name = "DIR")]
        dir: Option<std::path::PathBuf>,
        /// Force a filename instead of deriving it from the server.
        #[arg(long)]
        filename: Option<String>,
        /// Category subdirectory under the download dir.
        #[arg(long, default_value = "")]
        category: String,
        /// Scheduling priority: low, normal or high.
        #[arg(long, default_value = "normal")]
        priority: String,
        /// Extra request header, `Name: value`. Repeatable.
        #[arg(long = "header", value_name = "HEADER")]
        headers: Vec<String>,
        /// Raw Cookie header value.
        #[arg(long)]
        cookie: Option<String>,
        /// RFC3339 instant to start at (task stays `scheduled` until then).
        #[arg(long, value_name = "WHEN")]
        start_at: Option<String>,
        /// Expected SHA-256 of the finished file.
        #[arg(long, value_name = "HEX")]
        sha256: Option<String>,
        /// Expected MD5 of the finished file.
        #[arg(long, value_name = "HEX")]
        md5: Option<String>,
    },

    /// Run the engine until the queue drains.
    Run {
        /// Concurrent task ceiling for this run (1-10).
        #[arg(long, default_value = "4", value_name = "N")]
        jobs: usize,
        /// Also resume tasks parked in `error`.
        #[arg(long)]
        retry_errors: bool,
    },

    /// Show all tasks.
    List,

    /// Show the waiting queue in order.
    Queue,

    /// Pause a task by id.
    Pause { id: i64 },

    /// Re-queue a paused/stopped/failed task by id.
    Resume { id: i64 },

    /// Stop a task by id.
    Stop { id: i64 },

    /// Remove a task by id.
    Remove {
        id: i64,
        /// Also delete the downloaded file.
        #[arg(long)]
        delete_file: bool,
    },

    /// Move a queued task: first, prev, next or last.
    Move {
        id: i64,
        direction: String,
    },

    /// Set the global bandwidth limit in bytes/sec (0 = unlimited).
    Limit { bytes_per_sec: u64 },

    /// Set a per-host concurrent task cap (0 = unlimited).
    HostLimit { host: String, limit: usize },

    /// Probe a URL and print size, filename and range support.
    Probe { url: String },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);
        let store = Store::open_default().await?;

        match cli.command {
            CliCommand::Add {
                url,
                dir,
                filename,
                category,
                priority,
                headers,
                cookie,
                start_at,
                sha256,
                md5,
            } => {
                let dir = dir.or_else(|| std::env::current_dir().ok());
                run_add(
                    &store,
                    commands::AddArgs {
                        url,
                        dir,
                        filename,
                        category,
                        priority,
                        headers,
                        cookie,
                        start_at,
                        sha256,
                        md5,
                    },
                )
                .await?
            }
            CliCommand::Run { jobs, retry_errors } => {
                run_scheduler(&cfg, &store, jobs, retry_errors).await?
            }
            CliCommand::List => run_list(&store).await?,
            CliCommand::Queue => run_queue(&store).await?,
            CliCommand::Pause { id } => run_pause(&store, id).await?,
            CliCommand::Resume { id } => run_resume(&store, id).await?,
            CliCommand::Stop { id } => run_stop(&store, id).await?,
            CliCommand::Remove { id, delete_file } => run_remove(&store, id, delete_file).await?,
            CliCommand::Move { id, direction } => run_move(&store, id, &direction).await?,
            CliCommand::Limit { bytes_per_sec } => run_limit(&store, bytes_per_sec).await?,
            CliCommand::HostLimit { host, limit } => run_host_limit(&store, &host, limit).await?,
            CliCommand::Probe { url } => run_probe(&cfg, &url).await?,
        }

        Ok(())
    }
}
