//! Building the Easy2 handle for a connection request.

use anyhow::Result;

use curl::easy::Easy2;
use curl::multi::{Easy2Handle, Multi};

use crate::manager::ConnectionRequest;

use super::handler::ChunkHandler;
use super::CurlOptions;

/// Add a handle for `req` to the multi handle.
pub(super) fn add_request(
    multi: &Multi,
    req: &ConnectionRequest,
    opts: &CurlOptions,
) -> Result<Easy2Handle<ChunkHandler>> {
    let handler = ChunkHandler::new(req.chunk.clone(), req.position);
    let mut easy = Easy2::new(handler);
    easy.url(&req.url).map_err(|e| anyhow::anyhow!("curl url: {}", e))?;
    easy.follow_location(true)
        .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    easy.max_redirections(10)
        .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    easy.connect_timeout(opts.connect_timeout)
        .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    if let Some(sz) = opts.buffer_size {
        easy.buffer_size(sz)
            .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    }
    easy.useragent(&opts.user_agent)
        .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    // Stalls are detected by the manager's no-progress timeout.
    easy.low_speed_limit(0)
        .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    easy.range(&req.range())
        .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    tracing::debug!(download = req.download, url = %req.url, range = %req.range(), "connection started");
    multi
        .add2(easy)
        .map_err(|e| anyhow::anyhow!("curl multi add: {}", e))
}
