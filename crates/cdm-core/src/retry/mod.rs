//! Error classification and backoff for connection failures.
//!
//! Connection outcomes are mapped to an [`ErrorKind`]; the [`RetryPolicy`]
//! decides whether a resumable failure is retried after a capped exponential
//! delay or escalated to the download's pause/auto-retry path.

mod classify;
mod error;
mod policy;

pub use classify::{classify, classify_curl_error, classify_http_status};
pub use error::ConnectionError;
pub use policy::{ErrorKind, RetryDecision, RetryPolicy};
