//! CLI for the CDM download manager.

mod commands;

use anyhow::Result;
use cdm_core::config;
use cdm_core::queue_store::QueueStore;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use commands::{
    run_add, run_checksum, run_pause, run_queue, run_remove, run_resume, run_retry, run_status,
    AddArgs,
};

/// Top-level CLI for the CDM download manager.
#[derive(Debug, Parser)]
#[command(name = "cdm")]
#[command(about = "CDM: multi-connection chunked download manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Queue a new download.
    Add {
        /// Direct HTTP/HTTPS URL to download.
        url: String,
        /// Directory the finished file is moved to (default: config download_dir, else cwd).
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
        /// Connections for this download (default: server or global setting).
        #[arg(long, value_name = "N")]
        max_chunks: Option<usize>,
        /// Bytes per second for this download; 0 or negative = unlimited.
        #[arg(long, value_name = "BYTES", allow_negative_numbers = true)]
        speed_limit: Option<i64>,
        /// Expected SHA-256 of the whole file (hex).
        #[arg(long, value_name = "HEX")]
        sha256: Option<String>,
        /// Renaming mask for the destination, e.g. "*y*-*m*/*name*.*ext*".
        #[arg(long, value_name = "MASK")]
        mask: Option<String>,
    },

    /// Process the queue until nothing is left to do (ctrl-c saves and stops).
    Run {
        /// Downloads transferring at once (overrides the config file).
        #[arg(long, value_name = "N")]
        max_in_progress: Option<usize>,
        /// Restore and save the queue without opening any connection.
        #[arg(long)]
        offline: bool,
    },

    /// Show every download in the queue.
    Status,

    /// Pause a queued download by its ID.
    Pause {
        /// Download identifier.
        id: i64,
    },

    /// Queue a paused or canceled download again.
    Resume {
        /// Download identifier.
        id: i64,
    },

    /// Discard progress and download again from scratch.
    Retry {
        /// Download identifier.
        id: i64,
    },

    /// Remove a download from the queue.
    Remove {
        /// Download identifier.
        id: i64,
        /// Also delete the temp file and, for completed downloads, the final file.
        #[arg(long)]
        delete_files: bool,
    },

    /// Compute SHA-256 of a file (e.g. after download).
    Checksum {
        /// Path to the file.
        path: String,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);

        if let CliCommand::Checksum { path } = &cli.command {
            return run_checksum(Path::new(path)).await;
        }
        let store = QueueStore::open_default().await?;

        match cli.command {
            CliCommand::Add {
                url,
                dir,
                max_chunks,
                speed_limit,
                sha256,
                mask,
            } => {
                let args = AddArgs {
                    url,
                    dir,
                    max_chunks,
                    speed_limit,
                    sha256,
                    mask,
                };
                run_add(&store, &cfg, args).await?
            }
            CliCommand::Run {
                max_in_progress,
                offline,
            } => {
                let mut cfg = cfg;
                if let Some(n) = max_in_progress {
                    cfg.max_in_progress = n;
                }
                run_queue(&store, cfg, offline).await?
            }
            CliCommand::Status => run_status(&store).await?,
            CliCommand::Pause { id } => run_pause(&store, id).await?,
            CliCommand::Resume { id } => run_resume(&store, id).await?,
            CliCommand::Retry { id } => run_retry(&store, id).await?,
            CliCommand::Remove { id, delete_files } => run_remove(&store, id, delete_files).await?,
            CliCommand::Checksum { .. } => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
