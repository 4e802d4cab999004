use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::catalog::Catalog;
use crate::config::NodeConfig;
use crate::error::{Result, RunbookError};
use crate::logs::{LogPage, LogStore};
use crate::scheduler::stats::{self, JobStatistics, StatsScope};
use crate::scheduler::{
    CancelOutcome, ClaimQueue, Job, JobFilter, JobPage, JobRequest, JobStore, TaskDispatcher,
};
use crate::worker::{spawn_workers, ExecutionAdapter, Executor, JobController};

/// Main node that wires every component together.
///
/// Owns the job and log stores, the claim queue, the dispatcher and the
/// controller. Callers interact with jobs only through the methods here and
/// observe progress by polling [`Node::get_job`] and [`Node::get_logs`].
pub struct Node {
    pub config: NodeConfig,
    store: Arc<RwLock<JobStore>>,
    logs: Arc<RwLock<LogStore>>,
    queue: ClaimQueue,
    dispatcher: TaskDispatcher,
    controller: Arc<JobController>,
}

impl Node {
    /// Node running playbooks with the configured external tool.
    pub fn new(config: NodeConfig, catalog: Arc<dyn Catalog>, audit: Arc<dyn AuditSink>) -> Self {
        let executor = Arc::new(ExecutionAdapter::new(config.executor.clone()));
        Self::with_executor(config, catalog, executor, audit)
    }

    pub fn with_executor(
        config: NodeConfig,
        catalog: Arc<dyn Catalog>,
        executor: Arc<dyn Executor>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let store = Arc::new(RwLock::new(JobStore::with_capacity(config.max_jobs, audit)));
        let logs = Arc::new(RwLock::new(LogStore::new()));
        let queue = ClaimQueue::new(config.queue_capacity);
        let dispatcher = TaskDispatcher::new(catalog.clone(), store.clone(), queue.clone());
        let controller = Arc::new(JobController::new(
            store.clone(),
            logs.clone(),
            catalog,
            executor,
            config.executor.verbose,
        ));

        Self {
            config,
            store,
            logs,
            queue,
            dispatcher,
            controller,
        }
    }

    /// Spawn the worker loops. They run until `shutdown` is cancelled.
    pub fn start(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        tracing::info!(
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            "Starting workers"
        );
        spawn_workers(
            self.config.workers,
            self.queue.clone(),
            self.controller.clone(),
            shutdown,
        )
    }

    /// Validate, persist and enqueue a job. Returns once it is `pending`.
    pub async fn create_job(&self, request: JobRequest) -> Result<Job> {
        self.dispatcher.create_job(request).await
    }

    /// New job with the same inputs as a finished one.
    pub async fn retry(&self, job_id: &Uuid) -> Result<Job> {
        self.dispatcher.retry(job_id).await
    }

    /// Returns once `cancelled` is recorded; teardown may still be in flight.
    pub async fn cancel(&self, job_id: &Uuid, requester: &str) -> Result<CancelOutcome> {
        self.controller.cancel(job_id, requester).await
    }

    pub async fn get_job(&self, job_id: &Uuid) -> Option<Job> {
        self.store.read().await.get(job_id).cloned()
    }

    pub async fn get_job_by_id(&self, id: u64) -> Option<Job> {
        self.store.read().await.get_by_id(id).cloned()
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: usize,
        per_page: Option<usize>,
    ) -> JobPage {
        let per_page = self.config.page_size(per_page);
        self.store.read().await.list(filter, page, per_page)
    }

    /// Lines `[start_line, start_line + limit)` of a job's log.
    pub async fn get_logs(
        &self,
        job_id: &Uuid,
        start_line: u64,
        limit: Option<usize>,
    ) -> Result<LogPage> {
        if self.store.read().await.get(job_id).is_none() {
            return Err(RunbookError::JobNotFound(*job_id));
        }
        let limit = self.config.log_page_size(limit);
        Ok(self.logs.read().await.page(job_id, start_line, limit))
    }

    pub async fn statistics(&self, scope: &StatsScope) -> JobStatistics {
        let store = self.store.read().await;
        stats::compute(store.jobs(), scope, self.config.recent_failures_limit)
    }

    /// Drop the log lines of a finished job. Returns how many were removed.
    pub async fn purge_logs(&self, job_id: &Uuid) -> Result<usize> {
        let status = self
            .store
            .read()
            .await
            .status(job_id)
            .ok_or(RunbookError::JobNotFound(*job_id))?;
        if !status.is_terminal() {
            return Err(RunbookError::Validation(format!(
                "job {} is still {}; logs can only be purged once it has finished",
                job_id, status
            )));
        }
        if self.controller.is_active(job_id).await {
            return Err(RunbookError::Validation(format!(
                "job {} is {} but its execution is still shutting down; retry shortly",
                job_id, status
            )));
        }
        let removed = self.logs.write().await.remove(job_id);
        tracing::info!(job_id = %job_id, removed, "Job logs purged");
        Ok(removed)
    }

    pub fn queue(&self) -> &ClaimQueue {
        &self.queue
    }

    pub fn controller(&self) -> &Arc<JobController> {
        &self.controller
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("config", &self.config)
            .field("queue_depth", &self.queue.depth())
            .finish_non_exhaustive()
    }
}
