//! Server identity and per-server limits.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt;

use crate::config::{CdmConfig, ServerOverride};

/// Key identifying a remote server.
///
/// URLs are normalised down to `(scheme, host, port)` so that different paths on
/// the same origin share connection ceilings and the server bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HostKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl HostKey {
    /// Construct a host key from a URL string.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url).with_context(|| format!("invalid URL: {url}"))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("URL missing host: {url}"))?
            .to_ascii_lowercase();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("URL missing port and unknown default: {url}"))?;
        Ok(Self {
            scheme: parsed.scheme().to_string(),
            host,
            port,
        })
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Connection ceilings, default segment counts and rates per server.
#[derive(Debug, Clone, Default)]
pub struct ServerLimits {
    /// 0 = unlimited.
    default_connections: usize,
    default_speed_limit: i64,
    overrides: HashMap<String, ServerOverride>,
}

impl ServerLimits {
    pub fn new(default_connections: usize, default_speed_limit: i64) -> Self {
        Self {
            default_connections,
            default_speed_limit,
            overrides: HashMap::new(),
        }
    }

    pub fn from_config(cfg: &CdmConfig) -> Self {
        let mut limits = Self::new(cfg.per_server_connection_limit, cfg.per_server_speed_limit);
        for s in &cfg.servers {
            limits.add_override(s.clone());
        }
        limits
    }

    pub fn add_override(&mut self, ov: ServerOverride) {
        self.overrides.insert(ov.host.to_ascii_lowercase(), ov);
    }

    fn override_for(&self, host: &HostKey) -> Option<&ServerOverride> {
        self.overrides.get(&host.host)
    }

    /// Maximum simultaneous connections to `host`; `None` = unlimited.
    pub fn connection_limit(&self, host: &HostKey) -> Option<usize> {
        let n = self
            .override_for(host)
            .map(|o| o.connections)
            .filter(|&n| n > 0)
            .unwrap_or(self.default_connections);
        (n > 0).then_some(n)
    }

    /// Default chunk count for downloads from `host`, if overridden.
    pub fn segments(&self, host: &HostKey) -> Option<usize> {
        self.override_for(host).map(|o| o.segments).filter(|&n| n > 0)
    }

    pub fn speed_limit(&self, host: &HostKey) -> i64 {
        self.override_for(host)
            .map(|o| o.speed_limit)
            .filter(|&r| r > 0)
            .unwrap_or(self.default_speed_limit)
    }
}

/// Connections per server held by running downloads. A running download counts
/// at least once even while none of its chunks is connected.
#[derive(Debug, Clone, Default)]
pub struct ServerLoad {
    per_host: HashMap<HostKey, usize>,
}

impl ServerLoad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, host: &HostKey, active_chunks: usize) {
        *self.per_host.entry(host.clone()).or_insert(0) += active_chunks.max(1);
    }

    pub fn get(&self, host: &HostKey) -> usize {
        self.per_host.get(host).copied().unwrap_or(0)
    }

    /// Whether one more download may start on `host`.
    pub fn has_room(&self, host: &HostKey, limits: &ServerLimits) -> bool {
        limits
            .connection_limit(host)
            .map_or(true, |limit| self.get(host) < limit)
    }
}
