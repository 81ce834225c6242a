//! `cdm status` – show every download in the queue.

use anyhow::Result;
use cdm_core::download::DownloadSnapshot;
use cdm_core::queue_store::QueueStore;

fn progress(s: &DownloadSnapshot) -> String {
    let done: u64 = s.chunks.iter().map(|c| c.written).sum();
    match s.total_size {
        0 => "-".to_string(),
        total => format!("{:.1}%", done.min(total) as f64 * 100.0 / total as f64),
    }
}

pub async fn run_status(store: &QueueStore) -> Result<()> {
    let records = store.load_all().await?;
    if records.is_empty() {
        println!("No downloads in queue.");
        return Ok(());
    }
    println!("{:<6} {:<10} {:<12} {:<7} {}", "ID", "STATE", "SIZE", "DONE", "URL");
    for r in records {
        let s = &r.snapshot;
        let size = match s.total_size {
            0 => "-".to_string(),
            n => n.to_string(),
        };
        let done = if s.state == cdm_core::download::DownloadState::Complete {
            "100%".to_string()
        } else {
            progress(s)
        };
        println!("{:<6} {:<10} {:<12} {:<7} {}", r.id, s.state.to_string(), size, done, s.url);
        if let Some(f) = &s.failure {
            println!("       {}", f);
        }
    }
    Ok(())
}
