use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::logs::entry::{classify_event, LogEntry, LogLevel};
use crate::logs::store::LogStore;
use crate::worker::events::ExecutionEvent;

/// The single writer of one job's log.
///
/// Owned by the worker executing the job; the line counter lives here and
/// nowhere else, so line numbers stay contiguous regardless of how many
/// workers are ingesting other jobs at the same time.
#[derive(Debug)]
pub struct LogIngestor {
    job_id: Uuid,
    store: Arc<RwLock<LogStore>>,
    next_line: u64,
    verbose: bool,
}

impl LogIngestor {
    pub async fn new(job_id: Uuid, store: Arc<RwLock<LogStore>>, verbose: bool) -> Self {
        let next_line = store.read().await.total_lines(&job_id);
        Self {
            job_id,
            store,
            next_line,
            verbose,
        }
    }

    /// Classify and persist one event.
    pub async fn ingest(&mut self, event: &ExecutionEvent) -> Result<LogLevel> {
        let level = classify_event(event, self.verbose);
        self.record(level, event.to_string()).await?;
        Ok(level)
    }

    pub async fn record(&mut self, level: LogLevel, content: impl Into<String>) -> Result<()> {
        let entry = LogEntry {
            line_number: self.next_line,
            content: content.into(),
            level,
            timestamp: Utc::now(),
        };
        self.store.write().await.append(self.job_id, entry)?;
        self.next_line += 1;
        Ok(())
    }

    pub fn lines_written(&self) -> u64 {
        self.next_line
    }
}
