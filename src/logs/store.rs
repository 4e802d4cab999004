use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, RunbookError};
use crate::logs::entry::LogEntry;

/// One slice of a job's log.
#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub job_id: Uuid,
    pub entries: Vec<LogEntry>,
    pub total_lines: u64,
    pub has_more: bool,
    /// `start_line` to pass on the next poll
    pub next_line: u64,
}

/// Append-only per-job log storage.
///
/// Entries are never mutated. A job's lines are numbered `0..n` with no gaps;
/// an append whose number is not exactly `n` is rejected.
#[derive(Debug, Default)]
pub struct LogStore {
    logs: HashMap<Uuid, Vec<LogEntry>>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, job_id: Uuid, entry: LogEntry) -> Result<()> {
        let lines = self.logs.entry(job_id).or_default();
        let expected = lines.len() as u64;
        if entry.line_number != expected {
            return Err(RunbookError::Internal(format!(
                "log line {} for job {} out of sequence, expected {}",
                entry.line_number, job_id, expected
            )));
        }
        lines.push(entry);
        Ok(())
    }

    pub fn total_lines(&self, job_id: &Uuid) -> u64 {
        self.logs.get(job_id).map_or(0, |l| l.len() as u64)
    }

    /// Lines `[start_line, start_line + limit)`.
    pub fn page(&self, job_id: &Uuid, start_line: u64, limit: usize) -> LogPage {
        let lines = self.logs.get(job_id).map(Vec::as_slice).unwrap_or_default();
        let total_lines = lines.len() as u64;
        let start = start_line.min(total_lines) as usize;
        let end = start.saturating_add(limit).min(lines.len());
        let entries = lines[start..end].to_vec();
        let next_line = start_line.max(end as u64);

        LogPage {
            job_id: *job_id,
            has_more: (end as u64) < total_lines,
            total_lines,
            entries,
            next_line,
        }
    }

    /// Drop every line of a job. Returns how many were removed.
    pub fn remove(&mut self, job_id: &Uuid) -> usize {
        self.logs.remove(job_id).map_or(0, |l| l.len())
    }
}
