//! Log ingestion pipeline.
//!
//! - [`LogIngestor`]: per-job single writer, assigns line numbers and severity
//! - [`LogStore`]: append-only storage with paginated reads
//!
//! Readers poll with increasing `start_line`; because lines are only ever
//! appended at `n`, every line is observed exactly once.

pub mod entry;
pub mod ingest;
pub mod store;

pub use entry::{LogEntry, LogLevel};
pub use ingest::LogIngestor;
pub use store::{LogPage, LogStore};
