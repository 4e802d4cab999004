//! Read-only statistics over the job store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::PlaybookId;
use crate::scheduler::job::{FailureReason, Job, JobStatus};

/// Optional filters narrowing the set of jobs considered.
#[derive(Debug, Clone, Default)]
pub struct StatsScope {
    pub initiator: Option<String>,
    pub playbook_id: Option<PlaybookId>,
    /// Inclusive lower bound on `created_at`
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`
    pub to: Option<DateTime<Utc>>,
}

impl StatsScope {
    fn contains(&self, job: &Job) -> bool {
        self.initiator
            .as_deref()
            .map_or(true, |i| job.initiator == i)
            && self.playbook_id.map_or(true, |p| job.playbook_id == p)
            && self.from.map_or(true, |from| job.created_at >= from)
            && self.to.map_or(true, |to| job.created_at < to)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    fn add(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Success => self.success += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Percentage of finished runs that succeeded, cancelled jobs excluded.
    /// Zero when nothing has finished yet.
    pub fn success_rate(&self) -> f64 {
        let finished = self.success + self.failed;
        if finished == 0 {
            return 0.0;
        }
        round2(self.success as f64 * 100.0 / finished as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybookStatistics {
    pub playbook_id: PlaybookId,
    pub counts: StatusCounts,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureSummary {
    pub job_id: Uuid,
    pub playbook_id: PlaybookId,
    pub server_id: u64,
    pub exit_code: Option<i32>,
    pub reason: Option<FailureReason>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatistics {
    pub counts: StatusCounts,
    pub success_rate: f64,
    /// Mean run time over jobs with both start and completion times
    pub average_duration_secs: Option<f64>,
    pub by_playbook: Vec<PlaybookStatistics>,
    /// Newest first
    pub recent_failures: Vec<FailureSummary>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn compute<'a>(
    jobs: impl IntoIterator<Item = &'a Job>,
    scope: &StatsScope,
    recent_failures_limit: usize,
) -> JobStatistics {
    let mut counts = StatusCounts::default();
    let mut by_playbook: BTreeMap<PlaybookId, StatusCounts> = BTreeMap::new();
    let mut durations_ms: Vec<i64> = Vec::new();
    let mut failures: Vec<&Job> = Vec::new();

    for job in jobs.into_iter().filter(|j| scope.contains(j)) {
        counts.add(job.status);
        by_playbook.entry(job.playbook_id).or_default().add(job.status);
        if let Some(duration) = job.duration() {
            durations_ms.push(duration.num_milliseconds());
        }
        if job.status == JobStatus::Failed {
            failures.push(job);
        }
    }

    let average_duration_secs = if durations_ms.is_empty() {
        None
    } else {
        let total: i64 = durations_ms.iter().sum();
        Some(round2(total as f64 / durations_ms.len() as f64 / 1000.0))
    };

    failures.sort_by(|a, b| b.completed_at.cmp(&a.completed_at).then(b.id.cmp(&a.id)));
    let recent_failures = failures
        .into_iter()
        .take(recent_failures_limit)
        .map(|job| FailureSummary {
            job_id: job.job_id,
            playbook_id: job.playbook_id,
            server_id: job.server_id,
            exit_code: job.exit_code,
            reason: job.failure.clone(),
            completed_at: job.completed_at,
        })
        .collect();

    JobStatistics {
        success_rate: counts.success_rate(),
        counts,
        average_duration_secs,
        by_playbook: by_playbook
            .into_iter()
            .map(|(playbook_id, counts)| PlaybookStatistics {
                playbook_id,
                success_rate: counts.success_rate(),
                counts,
            })
            .collect(),
        recent_failures,
    }
}
