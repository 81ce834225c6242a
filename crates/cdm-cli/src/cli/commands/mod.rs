//! CLI command handlers, one per file.

mod add;
mod checksum;
mod edit;
mod remove;
mod run;
mod status;

pub use add::{run_add, AddArgs};
pub use checksum::run_checksum;
pub use edit::{run_pause, run_resume, run_retry};
pub use remove::run_remove;
pub use run::run_queue;
pub use status::run_status;
