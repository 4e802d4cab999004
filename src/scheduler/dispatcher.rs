use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::catalog::{Catalog, PlaybookId, ServerId, VarMap};
use crate::error::{Result, RunbookError};
use crate::scheduler::job::Job;
use crate::scheduler::queue::{ClaimMessage, ClaimQueue};
use crate::scheduler::store::{JobStore, NewJob};

/// A request to run one playbook against one server.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub playbook_id: PlaybookId,
    pub server_id: ServerId,
    pub initiator: String,
    pub extra_vars: VarMap,
}

impl JobRequest {
    pub fn new(playbook_id: PlaybookId, server_id: ServerId, initiator: impl Into<String>) -> Self {
        Self {
            playbook_id,
            server_id,
            initiator: initiator.into(),
            extra_vars: VarMap::new(),
        }
    }

    pub fn with_extra_vars(mut self, extra_vars: VarMap) -> Self {
        self.extra_vars = extra_vars;
        self
    }
}

/// Validates job requests, persists them and enqueues a claim.
///
/// Never waits on execution. Validation and infrastructure failures are
/// returned to the caller; nothing is persisted in either case.
#[derive(Clone)]
pub struct TaskDispatcher {
    catalog: Arc<dyn Catalog>,
    store: Arc<RwLock<JobStore>>,
    queue: ClaimQueue,
}

impl TaskDispatcher {
    pub fn new(catalog: Arc<dyn Catalog>, store: Arc<RwLock<JobStore>>, queue: ClaimQueue) -> Self {
        Self {
            catalog,
            store,
            queue,
        }
    }

    pub async fn create_job(&self, request: JobRequest) -> Result<Job> {
        self.submit(request, None).await
    }

    /// Create a fresh job with the same inputs as a finished one. The
    /// original is only referenced through `retry_of`.
    pub async fn retry(&self, job_id: &Uuid) -> Result<Job> {
        let original = self
            .store
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or(RunbookError::JobNotFound(*job_id))?;
        if !original.is_terminal() {
            return Err(RunbookError::Validation(format!(
                "job {} is still {} and cannot be retried",
                job_id, original.status
            )));
        }

        let request = JobRequest {
            playbook_id: original.playbook_id,
            server_id: original.server_id,
            initiator: original.initiator,
            extra_vars: original.extra_vars,
        };
        self.submit(request, Some(original.job_id)).await
    }

    fn validate(&self, request: &JobRequest) -> Result<()> {
        if request.initiator.trim().is_empty() {
            return Err(RunbookError::Validation(
                "initiator must not be empty".to_string(),
            ));
        }
        match self.catalog.playbook(request.playbook_id) {
            Some(playbook) if playbook.is_active => {}
            _ => {
                return Err(RunbookError::Validation(format!(
                    "Playbook with ID {} not found or inactive",
                    request.playbook_id
                )))
            }
        }
        match self.catalog.server(request.server_id) {
            Some(server) if server.is_active => Ok(()),
            _ => Err(RunbookError::Validation(format!(
                "Server with ID {} not found or inactive",
                request.server_id
            ))),
        }
    }

    async fn submit(&self, request: JobRequest, retry_of: Option<Uuid>) -> Result<Job> {
        self.validate(&request)?;

        let permit = self.queue.reserve()?;
        let job = self.store.write().await.insert(NewJob {
            playbook_id: request.playbook_id,
            server_id: request.server_id,
            initiator: request.initiator,
            extra_vars: request.extra_vars,
            retry_of,
        })?;
        permit.send(ClaimMessage { job_id: job.job_id });

        tracing::info!(
            job_id = %job.job_id,
            playbook_id = job.playbook_id,
            server_id = job.server_id,
            initiator = %job.initiator,
            retry_of = ?job.retry_of,
            "Job created"
        );
        Ok(job)
    }
}
