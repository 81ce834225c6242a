//! Map HTTP status codes and curl errors to retry kinds.

use super::error::ConnectionError;
use super::policy::ErrorKind;

pub fn classify_http_status(code: u32) -> ErrorKind {
    match code {
        408 => ErrorKind::Timeout,
        429 | 503 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(code as u16),
        _ => ErrorKind::Other,
    }
}

pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        return ErrorKind::Timeout;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
        || e.is_partial_file()
    {
        return ErrorKind::Connection;
    }
    ErrorKind::Other
}

pub fn classify(e: &ConnectionError) -> ErrorKind {
    match e {
        ConnectionError::Curl(ce) => classify_curl_error(ce),
        ConnectionError::Http(code) => classify_http_status(*code),
        ConnectionError::PartialTransfer { .. } => ErrorKind::Connection,
        ConnectionError::RangeRejected | ConnectionError::Storage(_) => ErrorKind::Other,
    }
}
