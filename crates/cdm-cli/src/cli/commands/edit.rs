//! `cdm pause|resume|retry <id>` – change a stored download while no `cdm run` holds it.

use anyhow::{bail, Result};
use cdm_core::download::{Download, DownloadState};
use cdm_core::queue_store::QueueStore;

async fn load(store: &QueueStore, id: i64) -> Result<Download> {
    let Some(record) = store.get(id).await? else {
        bail!("no download with id {id}");
    };
    let download = Download::load(id, record.snapshot, 1)?;
    Ok(download)
}

pub async fn run_pause(store: &QueueStore, id: i64) -> Result<()> {
    let mut d = load(store, id).await?;
    if d.state() != DownloadState::Queued {
        bail!("download {id} is {}, only queued downloads can be paused", d.state());
    }
    d.pause();
    store.save_download(id, &d.to_snapshot()).await?;
    println!("Paused download {id}");
    Ok(())
}

pub async fn run_resume(store: &QueueStore, id: i64) -> Result<()> {
    let mut d = load(store, id).await?;
    if !matches!(d.state(), DownloadState::Paused | DownloadState::Canceled) {
        bail!("download {id} is {}, nothing to resume", d.state());
    }
    d.queue();
    store.save_download(id, &d.to_snapshot()).await?;
    println!("Resumed download {id}");
    Ok(())
}

pub async fn run_retry(store: &QueueStore, id: i64) -> Result<()> {
    let mut d = load(store, id).await?;
    if d.state() == DownloadState::Complete {
        bail!("download {id} is already complete");
    }
    d.safe_retry();
    store.save_download(id, &d.to_snapshot()).await?;
    println!("Download {id} will start over");
    Ok(())
}
