use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::server::HostKey;

use super::{ByteBucket, ByteBucketTee, SHARED_BURST};

/// Owner of the process-wide global bucket and the lazily created per-server buckets.
#[derive(Debug)]
pub struct BucketPool {
    global: Arc<ByteBucket>,
    servers: Mutex<HashMap<HostKey, Arc<ByteBucket>>>,
}

impl BucketPool {
    pub fn new(global_rate: i64) -> Self {
        Self {
            global: Arc::new(ByteBucket::new(global_rate, SHARED_BURST, "global")),
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn global(&self) -> &Arc<ByteBucket> {
        &self.global
    }

    pub fn set_global_rate(&self, rate: i64) {
        self.global.set_byte_rate(rate);
    }

    /// Bucket for `host`, created on first use. An existing bucket adopts `rate`.
    pub fn server(&self, host: &HostKey, rate: i64) -> Arc<ByteBucket> {
        let mut servers = self.servers.lock().unwrap_or_else(|p| p.into_inner());
        let bucket = servers
            .entry(host.clone())
            .or_insert_with(|| Arc::new(ByteBucket::new(rate, SHARED_BURST, host.to_string())));
        bucket.set_byte_rate(rate);
        Arc::clone(bucket)
    }

    /// Tee charging the download bucket (if any), the server bucket and the global bucket.
    pub fn tee(
        &self,
        download: Option<Arc<ByteBucket>>,
        host: &HostKey,
        server_rate: i64,
    ) -> ByteBucketTee {
        let mut parts = Vec::with_capacity(3);
        parts.extend(download);
        parts.push(self.server(host, server_rate));
        parts.push(Arc::clone(&self.global));
        ByteBucketTee::new(parts)
    }
}
