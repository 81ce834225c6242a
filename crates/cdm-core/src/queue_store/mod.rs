//! Persistent download queue (SQLite via sqlx).
//!
//! Every download is stored as one JSON [`DownloadSnapshot`](crate::download::DownloadSnapshot)
//! row together with its position in the queue.

mod db;


pub use db::{QueueRecord, QueueStore};
pub(crate) use db::unix_timestamp;
