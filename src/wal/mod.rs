//! Write-ahead log: record codec, append-only log manager, and
//! ARIES-style recovery (analysis, redo, undo).

mod manager;
mod record;
pub mod recovery;

pub use manager::LogManager;
pub use record::{LogRecord, PageUpdate, RecordBody};
