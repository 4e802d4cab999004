use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::audit::{AuditSink, LifecycleEvent, Transition};
use crate::catalog::{PlaybookId, ServerId, VarMap};
use crate::error::{Result, RunbookError};
use crate::scheduler::job::{Job, JobStatus, Resolution, EXIT_CODE_CANCELLED};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Fields supplied by the dispatcher for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub playbook_id: PlaybookId,
    pub server_id: ServerId,
    pub initiator: String,
    pub extra_vars: VarMap,
    pub retry_of: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// This caller moved the job from pending to running and owns its execution.
    Claimed(Job),
    /// The job was already past pending. Redelivered claims land here.
    Skipped(JobStatus),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled { previous: JobStatus },
    /// The job reached a terminal state before the cancel arrived.
    AlreadyTerminal(JobStatus),
}

impl CancelOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            CancelOutcome::Cancelled { .. } => JobStatus::Cancelled,
            CancelOutcome::AlreadyTerminal(status) => *status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized(JobStatus),
    /// Someone else (a cancel) finalized the job first.
    AlreadyTerminal(JobStatus),
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub playbook_id: Option<PlaybookId>,
    pub server_id: Option<ServerId>,
    pub initiator: Option<String>,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.playbook_id.map_or(true, |p| job.playbook_id == p)
            && self.server_id.map_or(true, |s| job.server_id == s)
            && self
                .initiator
                .as_deref()
                .map_or(true, |i| job.initiator == i)
    }
}

#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// 1-based page number
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub pages: usize,
}

enum Cas {
    Applied,
    Conflict(JobStatus),
}

/// Source of truth for job rows.
///
/// All status changes go through [`JobStore::compare_and_set`], so with the
/// store behind a write lock each transition is atomic per job and no global
/// "current job" exists. Lifecycle events are emitted inside the same call.
pub struct JobStore {
    jobs: HashMap<Uuid, Job>,
    by_id: HashMap<u64, Uuid>,
    next_id: u64,
    max_jobs: usize,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("jobs", &self.jobs.len())
            .field("next_id", &self.next_id)
            .field("max_jobs", &self.max_jobs)
            .finish()
    }
}

impl JobStore {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS, audit)
    }

    pub fn with_capacity(max_jobs: usize, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            jobs: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
            max_jobs,
            audit,
        }
    }

    /// Persist a new job in `pending`.
    pub fn insert(&mut self, new: NewJob) -> Result<Job> {
        if self.is_full() {
            return Err(RunbookError::Infrastructure(format!(
                "job store is at capacity ({} jobs)",
                self.max_jobs
            )));
        }

        let mut job = Job::new(
            self.next_id,
            new.playbook_id,
            new.server_id,
            new.initiator,
            new.extra_vars,
        );
        job.retry_of = new.retry_of;
        self.next_id += 1;

        self.by_id.insert(job.id, job.job_id);
        self.jobs.insert(job.job_id, job.clone());
        self.audit.record(
            LifecycleEvent::new(job.job_id, Transition::Created, job.status)
                .with_actor(job.initiator.clone()),
        );
        Ok(job)
    }

    pub fn get(&self, job_id: &Uuid) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn get_by_id(&self, id: u64) -> Option<&Job> {
        self.by_id.get(&id).and_then(|job_id| self.jobs.get(job_id))
    }

    pub fn status(&self, job_id: &Uuid) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|j| j.status)
    }

    fn compare_and_set(
        &mut self,
        job_id: &Uuid,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<Cas> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or(RunbookError::JobNotFound(*job_id))?;
        if job.status != expected {
            return Ok(Cas::Conflict(job.status));
        }
        if !expected.can_transition_to(next) {
            return Err(RunbookError::InvalidTransition {
                job_id: *job_id,
                from: expected,
                to: next,
            });
        }
        job.status = next;
        job.updated_at = Utc::now();
        Ok(Cas::Applied)
    }

    /// `pending -> running`. Idempotent: any other current status is a no-op.
    pub fn claim(&mut self, job_id: &Uuid) -> ClaimOutcome {
        match self.compare_and_set(job_id, JobStatus::Pending, JobStatus::Running) {
            Ok(Cas::Applied) => {}
            Ok(Cas::Conflict(status)) => return ClaimOutcome::Skipped(status),
            Err(_) => return ClaimOutcome::NotFound,
        }
        let Some(job) = self.jobs.get_mut(job_id) else {
            return ClaimOutcome::NotFound;
        };
        job.started_at = Some(job.updated_at);
        let claimed = job.clone();
        self.audit.record(LifecycleEvent::new(
            claimed.job_id,
            Transition::Started,
            claimed.status,
        ));
        ClaimOutcome::Claimed(claimed)
    }

    /// `running -> success|failed`.
    pub fn finalize(
        &mut self,
        job_id: &Uuid,
        resolution: Resolution,
        artifacts: Option<PathBuf>,
    ) -> Result<FinalizeOutcome> {
        let status = resolution.status();
        if let Cas::Conflict(current) = self.compare_and_set(job_id, JobStatus::Running, status)? {
            if current.is_terminal() {
                return Ok(FinalizeOutcome::AlreadyTerminal(current));
            }
            return Err(RunbookError::InvalidTransition {
                job_id: *job_id,
                from: current,
                to: status,
            });
        }

        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or(RunbookError::JobNotFound(*job_id))?;
        job.exit_code = Some(resolution.exit_code());
        job.completed_at = Some(job.updated_at);
        job.artifacts = artifacts;
        if let Resolution::Failed { reason, .. } = resolution {
            job.failure = Some(reason);
        }
        self.audit
            .record(LifecycleEvent::new(*job_id, Transition::Completed, status));
        Ok(FinalizeOutcome::Finalized(status))
    }

    /// `pending|running -> cancelled`. A terminal job is returned unchanged.
    pub fn cancel(&mut self, job_id: &Uuid, requester: &str) -> Result<CancelOutcome> {
        let previous = self
            .status(job_id)
            .ok_or(RunbookError::JobNotFound(*job_id))?;
        if previous.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(previous));
        }
        // Single writer under the store lock, so the status read above still holds.
        if let Cas::Conflict(current) =
            self.compare_and_set(job_id, previous, JobStatus::Cancelled)?
        {
            return Ok(CancelOutcome::AlreadyTerminal(current));
        }

        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or(RunbookError::JobNotFound(*job_id))?;
        job.exit_code = Some(EXIT_CODE_CANCELLED);
        job.completed_at = Some(job.updated_at);
        job.cancelled_by = Some(requester.to_string());
        self.audit.record(
            LifecycleEvent::new(*job_id, Transition::Cancelled, JobStatus::Cancelled)
                .with_actor(requester),
        );
        Ok(CancelOutcome::Cancelled { previous })
    }

    /// Matching jobs, newest first.
    pub fn list(&self, filter: &JobFilter, page: usize, per_page: usize) -> JobPage {
        let per_page = per_page.max(1);
        let page = page.max(1);
        let mut matching: Vec<&Job> = self.jobs.values().filter(|j| filter.matches(j)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len();
        let jobs = matching
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .cloned()
            .collect();
        JobPage {
            jobs,
            page,
            per_page,
            total,
            pages: total.div_ceil(per_page),
        }
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::scheduler::job::FailureReason;

    fn new_job(playbook_id: PlaybookId, initiator: &str) -> NewJob {
        NewJob {
            playbook_id,
            server_id: 1,
            initiator: initiator.to_string(),
            extra_vars: VarMap::new(),
            retry_of: None,
        }
    }

    fn store() -> (JobStore, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        (JobStore::new(audit.clone()), audit)
    }

    #[test]
    fn claim_is_idempotent() {
        let (mut store, audit) = store();
        let job = store.insert(new_job(1, "alice")).unwrap();

        assert!(matches!(store.claim(&job.job_id), ClaimOutcome::Claimed(_)));
        assert!(matches!(
            store.claim(&job.job_id),
            ClaimOutcome::Skipped(JobStatus::Running)
        ));
        assert!(matches!(store.claim(&Uuid::new_v4()), ClaimOutcome::NotFound));
        assert_eq!(
            audit.transitions(&job.job_id),
            vec![Transition::Created, Transition::Started]
        );
    }

    #[test]
    fn finalize_sets_exit_code_and_completion() {
        let (mut store, _) = store();
        let job = store.insert(new_job(1, "alice")).unwrap();
        store.claim(&job.job_id);

        let outcome = store
            .finalize(
                &job.job_id,
                Resolution::failed(
                    FailureReason::TaskFailures {
                        failed: 1,
                        unreachable: 0,
                    },
                    2,
                ),
                None,
            )
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::Finalized(JobStatus::Failed));

        let job = store.get(&job.job_id).unwrap();
        assert_eq!(job.exit_code, Some(2));
        assert!(job.completed_at.is_some());
        assert!(job.started_at.is_some());
        assert!(job.failure.is_some());
    }

    #[test]
    fn finalize_pending_job_is_rejected() {
        let (mut store, _) = store();
        let job = store.insert(new_job(1, "alice")).unwrap();
        let err = store
            .finalize(&job.job_id, Resolution::Succeeded, None)
            .unwrap_err();
        assert!(matches!(err, RunbookError::InvalidTransition { .. }));
        assert_eq!(store.status(&job.job_id), Some(JobStatus::Pending));
    }

    #[test]
    fn cancel_after_finalize_is_a_no_op() {
        let (mut store, audit) = store();
        let job = store.insert(new_job(1, "alice")).unwrap();
        store.claim(&job.job_id);
        store
            .finalize(&job.job_id, Resolution::Succeeded, None)
            .unwrap();

        let outcome = store.cancel(&job.job_id, "bob").unwrap();
        assert_eq!(outcome, CancelOutcome::AlreadyTerminal(JobStatus::Success));
        let job_after = store.get(&job.job_id).unwrap();
        assert_eq!(job_after.exit_code, Some(0));
        assert!(job_after.cancelled_by.is_none());
        assert_eq!(
            audit.transitions(&job.job_id),
            vec![Transition::Created, Transition::Started, Transition::Completed]
        );
    }

    #[test]
    fn finalize_after_cancel_reports_already_terminal() {
        let (mut store, _) = store();
        let job = store.insert(new_job(1, "alice")).unwrap();
        store.claim(&job.job_id);
        store.cancel(&job.job_id, "bob").unwrap();

        let outcome = store
            .finalize(&job.job_id, Resolution::Succeeded, None)
            .unwrap();
        assert_eq!(
            outcome,
            FinalizeOutcome::AlreadyTerminal(JobStatus::Cancelled)
        );
        let job = store.get(&job.job_id).unwrap();
        assert_eq!(job.exit_code, Some(EXIT_CODE_CANCELLED));
        assert_eq!(job.cancelled_by.as_deref(), Some("bob"));
    }

    #[test]
    fn insert_fails_when_full() {
        let audit = Arc::new(MemoryAuditSink::new());
        let mut store = JobStore::with_capacity(1, audit);
        store.insert(new_job(1, "alice")).unwrap();
        let err = store.insert(new_job(1, "alice")).unwrap_err();
        assert!(matches!(err, RunbookError::Infrastructure(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn list_filters_and_paginates_newest_first() {
        let (mut store, _) = store();
        let mut ids = Vec::new();
        for i in 0..5 {
            let playbook = if i % 2 == 0 { 1 } else { 2 };
            ids.push(store.insert(new_job(playbook, "alice")).unwrap().id);
        }

        let page = store.list(&JobFilter::default(), 1, 2);
        assert_eq!(page.total, 5);
        assert_eq!(page.pages, 3);
        assert_eq!(
            page.jobs.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![ids[4], ids[3]]
        );

        let filter = JobFilter {
            playbook_id: Some(1),
            ..Default::default()
        };
        let page = store.list(&filter, 1, 10);
        assert_eq!(page.total, 3);
        assert!(page.jobs.iter().all(|j| j.playbook_id == 1));

        let last = store.list(&JobFilter::default(), 3, 2);
        assert_eq!(last.jobs.len(), 1);
        assert!(store.get_by_id(ids[0]).is_some());
    }
}
