use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::error::{Result, RunbookError};
use crate::logs::{LogIngestor, LogLevel, LogStore};
use crate::scheduler::job::{
    EXIT_CODE_CRASHED, EXIT_CODE_GENERIC_FAILURE, EXIT_CODE_LAUNCH_FAILED, EXIT_CODE_TIMED_OUT,
};
use crate::scheduler::store::FinalizeOutcome;
use crate::scheduler::{
    CancelOutcome, ClaimMessage, ClaimOutcome, FailureReason, Job, JobStatus, JobStore,
    Resolution,
};
use crate::worker::adapter::{
    ExecutionHandle, ExecutionOutcome, Executor, LaunchRequest, Termination,
};
use crate::worker::events::ExecutionEvent;

/// How long a cancelled execution may keep producing events, or take to
/// tear down, before the controller stops waiting for it.
const TEARDOWN_GRACE: Duration = Duration::from_secs(10);

/// Status signals accumulated from the event stream of one run.
#[derive(Debug, Default)]
struct RunSummary {
    recap: Option<(u32, u32)>,
    fatal: Option<String>,
}

impl RunSummary {
    fn observe(&mut self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::Recap { hosts } => {
                let (failed, unreachable) = ExecutionEvent::recap_failures(hosts);
                let (f, u) = self.recap.unwrap_or((0, 0));
                self.recap = Some((f + failed, u + unreachable));
            }
            ExecutionEvent::Fatal { host, message } => {
                if self.fatal.is_none() {
                    self.fatal = Some(match host {
                        Some(host) => format!("[{}] {}", host, message),
                        None => message.clone(),
                    });
                }
            }
            ExecutionEvent::HostResult { .. }
            | ExecutionEvent::PlayStart { .. }
            | ExecutionEvent::TaskStart { .. }
            | ExecutionEvent::Output { .. } => {}
        }
    }

    fn resolve(&self, outcome: &ExecutionOutcome) -> Resolution {
        match &outcome.termination {
            Termination::TimedOut { limit } => Resolution::failed(
                FailureReason::TimedOut {
                    after_secs: limit.as_secs(),
                },
                EXIT_CODE_TIMED_OUT,
            ),
            Termination::Crashed { message } => Resolution::failed(
                FailureReason::Crashed {
                    message: message.clone(),
                },
                outcome
                    .exit_code
                    .filter(|code| *code != 0)
                    .unwrap_or(EXIT_CODE_CRASHED),
            ),
            Termination::Cancelled => Resolution::failed(
                FailureReason::Crashed {
                    message: "execution aborted without a cancel request".to_string(),
                },
                EXIT_CODE_CRASHED,
            ),
            Termination::Exited => {
                let code = outcome.exit_code.unwrap_or(EXIT_CODE_CRASHED);
                if let Some(message) = &self.fatal {
                    return Resolution::failed(
                        FailureReason::Fatal {
                            message: message.clone(),
                        },
                        nonzero(code),
                    );
                }
                match self.recap {
                    Some((0, 0)) if code == 0 => Resolution::Succeeded,
                    Some((0, 0)) => Resolution::failed(
                        FailureReason::Crashed {
                            message: format!("exited with code {} after a clean recap", code),
                        },
                        code,
                    ),
                    Some((failed, unreachable)) => Resolution::failed(
                        FailureReason::TaskFailures {
                            failed,
                            unreachable,
                        },
                        nonzero(code),
                    ),
                    None => Resolution::failed(
                        FailureReason::Incomplete { exit_code: code },
                        nonzero(code),
                    ),
                }
            }
        }
    }
}

/// A failed job never reports 0, even when the process did.
fn nonzero(code: i32) -> i32 {
    if code == 0 {
        EXIT_CODE_GENERIC_FAILURE
    } else {
        code
    }
}

/// Claims jobs, drives their execution and is the only writer of
/// `Job.status` after creation.
///
/// Each running job has a [`CancellationToken`] registered here; a cancel
/// request records `cancelled` in the store first and then fires the token.
pub struct JobController {
    store: Arc<RwLock<JobStore>>,
    logs: Arc<RwLock<LogStore>>,
    catalog: Arc<dyn Catalog>,
    executor: Arc<dyn Executor>,
    active: Mutex<HashMap<Uuid, CancellationToken>>,
    verbose: bool,
}

impl JobController {
    pub fn new(
        store: Arc<RwLock<JobStore>>,
        logs: Arc<RwLock<LogStore>>,
        catalog: Arc<dyn Catalog>,
        executor: Arc<dyn Executor>,
        verbose: bool,
    ) -> Self {
        Self {
            store,
            logs,
            catalog,
            executor,
            active: Mutex::new(HashMap::new()),
            verbose,
        }
    }

    /// Handle one claim message. Redelivered or stale messages are no-ops.
    pub async fn process(&self, message: ClaimMessage) -> ClaimOutcome {
        let job_id = message.job_id;
        let token = CancellationToken::new();
        {
            let mut active = self.active.lock().await;
            if active.contains_key(&job_id) {
                tracing::debug!(job_id = %job_id, "Claim redelivered while executing, ignoring");
                return self
                    .store
                    .read()
                    .await
                    .status(&job_id)
                    .map_or(ClaimOutcome::NotFound, ClaimOutcome::Skipped);
            }
            active.insert(job_id, token.clone());
        }

        let outcome = self.store.write().await.claim(&job_id);
        match &outcome {
            ClaimOutcome::Claimed(job) => {
                tracing::info!(job_id = %job_id, playbook_id = job.playbook_id, "Job claimed");
                self.execute(job.clone(), token).await;
            }
            ClaimOutcome::Skipped(status) => {
                tracing::debug!(job_id = %job_id, status = %status, "Claim skipped");
            }
            ClaimOutcome::NotFound => {
                tracing::warn!(job_id = %job_id, "Claim for unknown job");
            }
        }

        self.active.lock().await.remove(&job_id);
        outcome
    }

    /// Record `cancelled` and, for a running job, signal its execution.
    pub async fn cancel(&self, job_id: &Uuid, requester: &str) -> Result<CancelOutcome> {
        let outcome = self.store.write().await.cancel(job_id, requester)?;
        match outcome {
            CancelOutcome::Cancelled {
                previous: JobStatus::Running,
            } => {
                if let Some(token) = self.active.lock().await.get(job_id) {
                    token.cancel();
                }
                tracing::info!(job_id = %job_id, requester, "Running job cancelled");
            }
            CancelOutcome::Cancelled { previous } => {
                tracing::info!(job_id = %job_id, requester, previous = %previous, "Job cancelled");
            }
            CancelOutcome::AlreadyTerminal(status) => {
                tracing::info!(
                    job_id = %job_id,
                    requester,
                    status = %status,
                    "Cancel ignored, job already finished"
                );
            }
        }
        Ok(outcome)
    }

    /// Whether an execution for `job_id` is still running or tearing down.
    pub async fn is_active(&self, job_id: &Uuid) -> bool {
        self.active.lock().await.contains_key(job_id)
    }

    async fn execute(&self, job: Job, token: CancellationToken) {
        let job_id = job.job_id;
        let mut ingestor = LogIngestor::new(job_id, self.logs.clone(), self.verbose).await;
        if token.is_cancelled() {
            return;
        }

        let launched = self
            .launch_request(&job)
            .and_then(|request| {
                let summary = format!(
                    "Running playbook '{}' against {}",
                    request.playbook.name, request.server.hostname
                );
                self.executor
                    .launch(request, token.clone())
                    .map(|handle| (handle, summary))
            });
        let (handle, summary_line) = match launched {
            Ok(launched) => launched,
            Err(e) => {
                let message = match e {
                    RunbookError::AdapterLaunch(message) => message,
                    other => other.to_string(),
                };
                tracing::warn!(job_id = %job_id, error = %message, "Playbook launch failed");
                self.write(&mut ingestor, LogLevel::Error, format!("failed to launch: {}", message))
                    .await;
                self.finish(
                    &mut ingestor,
                    job_id,
                    Resolution::failed(
                        FailureReason::LaunchFailed { message },
                        EXIT_CODE_LAUNCH_FAILED,
                    ),
                    None,
                )
                .await;
                return;
            }
        };
        self.write(&mut ingestor, LogLevel::Info, summary_line).await;

        let ExecutionHandle {
            mut events,
            outcome,
        } = handle;
        let mut summary = RunSummary::default();
        let cancelled = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break true,
                event = events.recv() => match event {
                    Some(event) => {
                        summary.observe(&event);
                        self.ingest(&mut ingestor, &event).await;
                    }
                    None => break false,
                }
            }
        };

        if cancelled {
            while let Ok(event) = events.try_recv() {
                self.ingest(&mut ingestor, &event).await;
            }
            self.close_cancelled(&mut ingestor, &job_id).await;
            self.discard_late_events(&mut ingestor, events).await;
            let abort = outcome.abort_handle();
            if tokio::time::timeout(TEARDOWN_GRACE, outcome).await.is_err() {
                tracing::warn!(job_id = %job_id, "Execution teardown exceeded grace period, aborting");
                abort.abort();
            }
            return;
        }

        let outcome = match outcome.await {
            Ok(outcome) => outcome,
            Err(e) => ExecutionOutcome::crashed(format!("execution task failed: {}", e)),
        };
        if token.is_cancelled() {
            self.close_cancelled(&mut ingestor, &job_id).await;
            return;
        }
        let resolution = summary.resolve(&outcome);
        self.finish(&mut ingestor, job_id, resolution, outcome.artifacts)
            .await;
    }

    fn launch_request(&self, job: &Job) -> Result<LaunchRequest> {
        let playbook = self
            .catalog
            .playbook(job.playbook_id)
            .filter(|p| p.is_active)
            .ok_or_else(|| {
                RunbookError::AdapterLaunch(format!(
                    "Playbook with ID {} not found or inactive",
                    job.playbook_id
                ))
            })?;
        let server = self
            .catalog
            .server(job.server_id)
            .filter(|s| s.is_active)
            .ok_or_else(|| {
                RunbookError::AdapterLaunch(format!(
                    "Server with ID {} not found or inactive",
                    job.server_id
                ))
            })?;
        Ok(LaunchRequest {
            job_id: job.job_id,
            playbook,
            server,
            extra_vars: job.extra_vars.clone(),
        })
    }

    async fn ingest(&self, ingestor: &mut LogIngestor, event: &ExecutionEvent) {
        if let Err(e) = ingestor.ingest(event).await {
            tracing::error!(error = %e, "Failed to record log line");
        }
    }

    async fn write(&self, ingestor: &mut LogIngestor, level: LogLevel, content: String) {
        if let Err(e) = ingestor.record(level, content).await {
            tracing::error!(error = %e, "Failed to record log line");
        }
    }

    async fn close_cancelled(&self, ingestor: &mut LogIngestor, job_id: &Uuid) {
        let requester = self
            .store
            .read()
            .await
            .get(job_id)
            .and_then(|job| job.cancelled_by.clone())
            .unwrap_or_else(|| "unknown".to_string());
        self.write(ingestor, LogLevel::Warning, format!("job cancelled by {}", requester))
            .await;
    }

    /// Events still in flight after the job was finalized are dropped, each
    /// leaving a WARNING line behind.
    async fn discard_late_events(
        &self,
        ingestor: &mut LogIngestor,
        mut events: mpsc::Receiver<ExecutionEvent>,
    ) {
        let drain = async {
            while let Some(event) = events.recv().await {
                self.write(
                    ingestor,
                    LogLevel::Warning,
                    format!("post-terminal event ignored: {}", event),
                )
                .await;
            }
        };
        if tokio::time::timeout(TEARDOWN_GRACE, drain).await.is_err() {
            tracing::warn!("Execution kept emitting events after cancellation");
        }
    }

    /// Writes the closing log line and finalizes the job under one store
    /// write guard, so a concurrent cancel lands either before (and the job
    /// closes as cancelled) or after (and is rejected as already terminal).
    async fn finish(
        &self,
        ingestor: &mut LogIngestor,
        job_id: Uuid,
        resolution: Resolution,
        artifacts: Option<PathBuf>,
    ) {
        let mut store = self.store.write().await;
        match store.status(&job_id) {
            Some(JobStatus::Cancelled) => {
                drop(store);
                self.close_cancelled(ingestor, &job_id).await;
                return;
            }
            Some(status) if !status.is_terminal() => {}
            _ => return,
        }

        match &resolution {
            Resolution::Succeeded => {
                self.write(ingestor, LogLevel::Info, "job completed successfully".to_string())
                    .await
            }
            Resolution::Failed { reason, exit_code } => {
                self.write(
                    ingestor,
                    LogLevel::Error,
                    format!("job failed (exit code {}): {}", exit_code, reason),
                )
                .await
            }
        }

        let result = store.finalize(&job_id, resolution.clone(), artifacts);
        drop(store);
        match result {
            Ok(FinalizeOutcome::Finalized(status)) => tracing::info!(
                job_id = %job_id,
                status = %status,
                exit_code = resolution.exit_code(),
                lines = ingestor.lines_written(),
                "Job finished"
            ),
            Ok(FinalizeOutcome::AlreadyTerminal(status)) => tracing::info!(
                job_id = %job_id,
                status = %status,
                "Job was finalized concurrently"
            ),
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "Failed to finalize job"),
        }
    }
}

impl std::fmt::Debug for JobController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobController")
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}
