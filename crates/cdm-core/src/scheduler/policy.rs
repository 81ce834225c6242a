use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::download::{Download, DownloadId};
use crate::server::HostKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerPolicy {
    /// Queue order.
    Fifo,
    /// Smallest known remaining size first, unknown sizes last.
    #[default]
    Fast,
    /// Round-robin across servers.
    Fair,
    Random,
}

impl SchedulerPolicy {
    /// Candidate order for `queued`, which is in queue order.
    pub(crate) fn order(self, queued: &[&Download]) -> Vec<DownloadId> {
        match self {
            SchedulerPolicy::Fifo => queued.iter().map(|d| d.id()).collect(),
            SchedulerPolicy::Fast => {
                let mut v: Vec<&&Download> = queued.iter().collect();
                // Stable sort keeps queue order on ties.
                v.sort_by_key(|d| d.remaining().unwrap_or(u64::MAX));
                v.into_iter().map(|d| d.id()).collect()
            }
            SchedulerPolicy::Fair => round_robin(queued),
            SchedulerPolicy::Random => {
                let mut ids: Vec<DownloadId> = queued.iter().map(|d| d.id()).collect();
                ids.shuffle(&mut rand::thread_rng());
                ids
            }
        }
    }
}

/// First download of each server, then the second of each, and so on. Servers
/// keep the order in which they first appear in the queue.
fn round_robin(queued: &[&Download]) -> Vec<DownloadId> {
    let mut hosts: Vec<&HostKey> = Vec::new();
    let mut per_host: HashMap<&HostKey, Vec<DownloadId>> = HashMap::new();
    for d in queued {
        let list = per_host.entry(d.host()).or_insert_with(|| {
            hosts.push(d.host());
            Vec::new()
        });
        list.push(d.id());
    }
    let rounds = per_host.values().map(Vec::len).max().unwrap_or(0);
    let mut out = Vec::with_capacity(queued.len());
    for round in 0..rounds {
        for host in &hosts {
            if let Some(id) = per_host.get(host).and_then(|l| l.get(round)) {
                out.push(*id);
            }
        }
    }
    out
}
