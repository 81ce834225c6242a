//! `cdm run` – process the queue until nothing is left to do.

use anyhow::{Context, Result};
use cdm_core::config::CdmConfig;
use cdm_core::download::DownloadState;
use cdm_core::finish::FileFinisher;
use cdm_core::manager::{Manager, ManagerEvent};
use cdm_core::queue_store::QueueStore;
use cdm_core::transfer::{CurlOptions, Engine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub async fn run_queue(store: &QueueStore, cfg: CdmConfig, offline: bool) -> Result<()> {
    let records = store.load_all().await?;
    if records.is_empty() {
        println!("No downloads in queue.");
        return Ok(());
    }
    let finisher = Arc::new(FileFinisher::new(cfg.on_verify_error));
    let mut manager = Manager::with_disk(cfg).context("starting disk writer")?;
    for r in records {
        if let Err(e) = manager.restore(r.id, r.snapshot) {
            tracing::warn!(download = r.id, "skipping stored download: {e}");
        }
    }
    manager.set_offline(offline);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nstopping; saving progress...");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ManagerEvent>();
    let engine = tokio::task::spawn_blocking(move || -> Result<Manager> {
        let mut engine = Engine::new(CurlOptions::default());
        engine.run_until_idle(
            &mut manager,
            finisher,
            |event| {
                let _ = tx.send(event);
            },
            &stop,
        )?;
        Ok(manager)
    });

    // The channel closes when the engine returns.
    while let Some(event) = rx.recv().await {
        persist(store, event).await;
    }
    let manager = engine.await.context("engine thread panicked")??;

    let complete = manager.count(DownloadState::Complete);
    let canceled = manager.count(DownloadState::Canceled);
    let left = manager.downloads().len() - complete - canceled;
    println!("{complete} complete, {canceled} canceled, {left} left in queue.");
    Ok(())
}

async fn persist(store: &QueueStore, event: ManagerEvent) {
    match event {
        ManagerEvent::StateChanged { id, from, to } => {
            println!("download {id}: {from} -> {to}");
        }
        ManagerEvent::Snapshot { id, snapshot } => {
            if let Err(e) = store.save_download(id, &snapshot).await {
                tracing::warn!(download = id, "could not save progress: {e:#}");
            }
        }
        ManagerEvent::Progress {
            id,
            partial_size,
            total_size,
            bytes_per_sec,
        } => {
            let done_mib = partial_size as f64 / 1_048_576.0;
            let rate_mib = bytes_per_sec as f64 / 1_048_576.0;
            if total_size > 0 {
                let pct = partial_size as f64 * 100.0 / total_size as f64;
                println!(
                    "  {id}: {:.1} / {:.1} MiB ({:.1}%)  {:.2} MiB/s",
                    done_mib,
                    total_size as f64 / 1_048_576.0,
                    pct,
                    rate_mib
                );
            } else {
                println!("  {id}: {:.1} MiB  {:.2} MiB/s", done_mib, rate_mib);
            }
        }
        ManagerEvent::Removed { id } => {
            if let Err(e) = store.delete_download(id).await {
                tracing::warn!(download = id, "could not delete stored download: {e:#}");
            }
        }
    }
}
