pub mod config;
pub mod logging;

pub mod bucket;
pub mod checksum;
pub mod chunk;
pub mod download;
pub mod finish;
pub mod manager;
pub mod memory;
pub mod queue_store;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod transfer;
pub mod url_model;
