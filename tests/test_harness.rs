//! Shared fixtures for integration tests.
//!
//! Provides a scripted executor, catalog fixtures and polling helpers.
#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use runbook_lite::audit::MemoryAuditSink;
use runbook_lite::catalog::{ConnectionParams, InMemoryCatalog, Playbook, Server, VarMap};
use runbook_lite::config::{ExecutorConfig, NodeConfig};
use runbook_lite::error::{Result, RunbookError};
use runbook_lite::logs::LogEntry;
use runbook_lite::node::Node;
use runbook_lite::scheduler::{Job, JobStatus};
use runbook_lite::worker::{
    ExecutionEvent, ExecutionHandle, ExecutionOutcome, Executor, HostOutcome, HostStats,
    LaunchRequest, Termination,
};

pub const ACTIVE_PLAYBOOK: u64 = 1;
pub const INACTIVE_PLAYBOOK: u64 = 2;
pub const ACTIVE_SERVER: u64 = 1;
pub const INACTIVE_SERVER: u64 = 2;
pub const SECOND_SERVER: u64 = 3;

pub const WAIT: Duration = Duration::from_secs(10);

/// One step of a scripted execution.
#[derive(Debug, Clone)]
pub enum Step {
    Emit(ExecutionEvent),
    /// Pause; a cancel during the pause ends the run as cancelled.
    Sleep(Duration),
    /// Block until cancelled, then keep emitting `late` once the controller
    /// has had time to finalize.
    WaitForCancel { late: Vec<ExecutionEvent> },
    /// Hold the run until the test releases it; cancellation is ignored.
    Gate(Arc<Notify>),
}

/// Executor that replays the same script for every job.
#[derive(Debug)]
pub struct ScriptedExecutor {
    steps: Vec<Step>,
    exit_code: Option<i32>,
    termination: Termination,
    launch_error: Option<String>,
    launches: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    launched: Mutex<Vec<Uuid>>,
}

impl ScriptedExecutor {
    /// Replays `steps`, then exits with code 0.
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            exit_code: Some(0),
            termination: Termination::Exited,
            launch_error: None,
            launches: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            launched: Mutex::new(Vec::new()),
        }
    }

    pub fn with_exit(mut self, exit_code: Option<i32>, termination: Termination) -> Self {
        self.exit_code = exit_code;
        self.termination = termination;
        self
    }

    /// Every launch fails with an adapter launch error.
    pub fn failing_launch(message: &str) -> Self {
        let mut executor = Self::new(Vec::new());
        executor.launch_error = Some(message.to_string());
        executor
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn launched_jobs(&self) -> Vec<Uuid> {
        self.launched.lock().unwrap().clone()
    }
}

impl Executor for ScriptedExecutor {
    fn launch(
        &self,
        request: LaunchRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionHandle> {
        if let Some(message) = &self.launch_error {
            return Err(RunbookError::AdapterLaunch(message.clone()));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.launched.lock().unwrap().push(request.job_id);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(16);
        let steps = self.steps.clone();
        let exit_code = self.exit_code;
        let termination = self.termination.clone();
        let in_flight = self.in_flight.clone();

        let outcome = tokio::spawn(async move {
            let cancelled = ExecutionOutcome {
                exit_code: None,
                termination: Termination::Cancelled,
                artifacts: None,
            };
            let result = 'run: {
                for step in steps {
                    match step {
                        Step::Emit(event) => {
                            if tx.send(event).await.is_err() {
                                break 'run ExecutionOutcome::crashed("consumer went away");
                            }
                        }
                        Step::Sleep(duration) => {
                            tokio::select! {
                                _ = cancel.cancelled() => break 'run cancelled,
                                _ = tokio::time::sleep(duration) => {}
                            }
                        }
                        Step::WaitForCancel { late } => {
                            cancel.cancelled().await;
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            for event in late {
                                let _ = tx.send(event).await;
                            }
                            break 'run cancelled;
                        }
                        Step::Gate(gate) => gate.notified().await,
                    }
                }
                ExecutionOutcome {
                    exit_code,
                    termination,
                    artifacts: None,
                }
            };
            in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        });

        Ok(ExecutionHandle {
            events: rx,
            outcome,
        })
    }
}

// =============================================================================
// Events
// =============================================================================

pub fn play(name: &str) -> ExecutionEvent {
    ExecutionEvent::PlayStart { name: name.into() }
}

pub fn task(name: &str) -> ExecutionEvent {
    ExecutionEvent::TaskStart { name: name.into() }
}

pub fn host(outcome: HostOutcome) -> ExecutionEvent {
    ExecutionEvent::HostResult {
        host: "web1".into(),
        outcome,
        detail: None,
    }
}

pub fn recap(failed: u32, unreachable: u32) -> ExecutionEvent {
    ExecutionEvent::Recap {
        hosts: vec![HostStats {
            host: "web1".into(),
            ok: 3,
            changed: 1,
            failed,
            unreachable,
            ..Default::default()
        }],
    }
}

/// A clean run: one play, two tasks, zero failures in the recap.
pub fn successful_run() -> Vec<Step> {
    vec![
        Step::Emit(play("Configure web servers")),
        Step::Emit(task("Gathering Facts")),
        Step::Emit(host(HostOutcome::Ok)),
        Step::Emit(task("Install nginx")),
        Step::Emit(host(HostOutcome::Changed)),
        Step::Emit(recap(0, 0)),
    ]
}

// =============================================================================
// Catalog and node fixtures
// =============================================================================

pub fn playbook(id: u64, file_location: PathBuf, is_active: bool) -> Playbook {
    let mut default_vars = VarMap::new();
    default_vars.insert("http_port".into(), serde_json::json!(80));
    default_vars.insert("app_user".into(), serde_json::json!("www"));
    Playbook {
        id,
        name: format!("playbook-{}", id),
        file_location,
        default_vars,
        is_active,
    }
}

pub fn server(id: u64, hostname: &str, is_active: bool) -> Server {
    Server {
        id,
        hostname: hostname.into(),
        connection: ConnectionParams {
            address: "127.0.0.1".into(),
            port: 22,
            user: "deploy".into(),
            private_key: None,
        },
        is_active,
    }
}

/// Playbooks 1 (active) and 2 (inactive); servers 1 (active), 2 (inactive), 3 (active).
pub fn test_catalog() -> InMemoryCatalog {
    InMemoryCatalog::new()
        .with_playbook(playbook(ACTIVE_PLAYBOOK, PathBuf::from("site.yml"), true))
        .with_playbook(playbook(INACTIVE_PLAYBOOK, PathBuf::from("old.yml"), false))
        .with_server(server(ACTIVE_SERVER, "web1", true))
        .with_server(server(INACTIVE_SERVER, "web2", false))
        .with_server(server(SECOND_SERVER, "db1", true))
}

pub fn test_config() -> NodeConfig {
    NodeConfig::new(ExecutorConfig::default()).with_workers(2)
}

/// Node backed by `executor` and an in-memory audit sink. Workers are not started.
pub fn test_node(
    config: NodeConfig,
    executor: Arc<ScriptedExecutor>,
) -> (Node, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let node = Node::with_executor(config, Arc::new(test_catalog()), executor, audit.clone());
    (node, audit)
}

// =============================================================================
// Polling helpers
// =============================================================================

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}

pub async fn wait_for_status(node: &Node, job_id: &Uuid, status: JobStatus) {
    assert_eventually(
        || async move { node.get_job(job_id).await.map(|j| j.status) == Some(status) },
        WAIT,
        &format!("job {} never reached {}", job_id, status),
    )
    .await;
}

pub async fn wait_for_terminal(node: &Node, job_id: &Uuid) -> Job {
    assert_eventually(
        || async move { node.get_job(job_id).await.is_some_and(|j| j.is_terminal()) },
        WAIT,
        &format!("job {} never finished", job_id),
    )
    .await;
    node.get_job(job_id).await.unwrap()
}

/// Every log line of a job.
pub async fn all_logs(node: &Node, job_id: &Uuid) -> Vec<LogEntry> {
    node.get_logs(job_id, 0, Some(1000)).await.unwrap().entries
}
