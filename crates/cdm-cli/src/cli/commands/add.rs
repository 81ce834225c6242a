//! `cdm add <url>` – queue a new download.

use anyhow::{Context, Result};
use cdm_core::checksum::HashSpec;
use cdm_core::config::CdmConfig;
use cdm_core::download::{Download, DownloadOptions};
use cdm_core::queue_store::QueueStore;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct AddArgs {
    pub url: String,
    pub dir: Option<PathBuf>,
    pub max_chunks: Option<usize>,
    pub speed_limit: Option<i64>,
    pub sha256: Option<String>,
    pub mask: Option<String>,
}

pub async fn run_add(store: &QueueStore, cfg: &CdmConfig, args: AddArgs) -> Result<()> {
    let destination_dir = match args.dir.or_else(|| cfg.download_dir.clone()) {
        Some(dir) => dir,
        None => std::env::current_dir().context("current directory")?,
    };
    let opts = DownloadOptions {
        url: args.url,
        destination_dir,
        file_name: None,
        mask: args.mask.or_else(|| cfg.default_mask.clone()),
        max_chunks: args.max_chunks.unwrap_or(0),
        speed_limit: args.speed_limit.unwrap_or(-1),
        hash: args.sha256.map(HashSpec::sha256),
    };
    // Validates the URL and derives the file name; the store assigns the id.
    let download = Download::new(0, opts, cfg.max_chunks)?;
    let id = store.queue_download(&download.to_snapshot()).await?;
    println!(
        "Added download {id}: {} -> {}",
        download.url(),
        download.destination().display()
    );
    Ok(())
}
