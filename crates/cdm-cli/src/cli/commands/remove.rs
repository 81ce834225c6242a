//! `cdm remove <id>` – remove a download; optionally delete its files with --delete-files.

use anyhow::{bail, Result};
use cdm_core::download::{Download, DownloadState};
use cdm_core::queue_store::QueueStore;

/// Removes the download from the store. With `delete_files` the temp file goes,
/// and for a completed download the final file too.
pub async fn run_remove(store: &QueueStore, id: i64, delete_files: bool) -> Result<()> {
    let Some(record) = store.get(id).await? else {
        bail!("no download with id {id}");
    };
    if delete_files {
        let d = Download::load(id, record.snapshot, 1)?;
        let mut paths = vec![d.temp_path()];
        if d.state() == DownloadState::Complete {
            paths.push(d.destination());
        }
        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "deleted file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), "could not delete file: {}", e),
            }
        }
    }

    store.delete_download(id).await?;
    println!("Removed download {id}");
    Ok(())
}
