use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::{Playbook, Server, VarMap};
use crate::config::ExecutorConfig;
use crate::error::{Result, RunbookError};
use crate::worker::events::{EventParser, ExecutionEvent};
use crate::worker::workspace::{merge_vars, ArtifactStore, Workspace};

const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to run one job, resolved from the catalog by the controller.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub job_id: Uuid,
    pub playbook: Playbook,
    pub server: Server,
    /// The job's own variables, merged over the playbook defaults at launch
    pub extra_vars: VarMap,
}

/// How the execution ended, from the adapter's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The process ran to completion and reported an exit code.
    Exited,
    /// The adapter killed the process after the maximum duration.
    TimedOut { limit: Duration },
    /// The cancellation token fired and the process was torn down.
    Cancelled,
    /// The process died without an exit code or its output could not be read.
    Crashed { message: String },
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub exit_code: Option<i32>,
    pub termination: Termination,
    pub artifacts: Option<PathBuf>,
}

impl ExecutionOutcome {
    pub fn crashed(message: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            termination: Termination::Crashed {
                message: message.into(),
            },
            artifacts: None,
        }
    }
}

/// A launched execution: a bounded event stream plus the task that
/// resolves once the process is gone and the workspace released.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub events: mpsc::Receiver<ExecutionEvent>,
    pub outcome: JoinHandle<ExecutionOutcome>,
}

/// Runs a playbook for a job.
///
/// `launch` returns [`RunbookError::AdapterLaunch`] without emitting any
/// event when the run cannot start. Once it returns a handle, every exit
/// path ends in an [`ExecutionOutcome`].
pub trait Executor: Send + Sync {
    fn launch(&self, request: LaunchRequest, cancel: CancellationToken)
        -> Result<ExecutionHandle>;
}

/// Drives the external automation tool as a child process.
#[derive(Debug, Clone)]
pub struct ExecutionAdapter {
    config: ExecutorConfig,
    artifacts: Option<ArtifactStore>,
}

impl ExecutionAdapter {
    pub fn new(config: ExecutorConfig) -> Self {
        let artifacts = config.artifacts.clone().map(ArtifactStore::new);
        Self { config, artifacts }
    }

    fn command(&self, workspace: &Workspace, playbook: &Playbook) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.program_args)
            .arg("-i")
            .arg(workspace.inventory_path())
            .arg("--extra-vars")
            .arg(format!("@{}", workspace.vars_path().display()));
        if self.config.verbose {
            cmd.arg("-v");
        }
        cmd.arg(&playbook.file_location)
            .current_dir(workspace.path())
            .env("ANSIBLE_NOCOLOR", "1")
            .env("ANSIBLE_FORCE_COLOR", "0")
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .env("ANSIBLE_RETRY_FILES_ENABLED", "False")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Executor for ExecutionAdapter {
    fn launch(
        &self,
        request: LaunchRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionHandle> {
        let playbook = &request.playbook;
        if !playbook.file_location.is_file() {
            return Err(RunbookError::AdapterLaunch(format!(
                "playbook file not found: {}",
                playbook.file_location.display()
            )));
        }

        let vars = merge_vars(&playbook.default_vars, &request.extra_vars);
        let workspace = Workspace::prepare(&self.config, request.job_id, &request.server, &vars)?;

        let mut child = self.command(&workspace, playbook).spawn().map_err(|e| {
            RunbookError::AdapterLaunch(format!(
                "cannot start {}: {}",
                self.config.program.display(),
                e
            ))
        })?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(RunbookError::AdapterLaunch(
                "child process has no output pipes".to_string(),
            ));
        };

        tracing::info!(
            job_id = %request.job_id,
            playbook = %playbook.name,
            server = %request.server.hostname,
            pid = ?child.id(),
            "Playbook launched"
        );

        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let stderr_task = tokio::spawn(forward_stderr(BufReader::new(stderr), tx.clone()));
        let supervisor = Supervisor {
            job_id: request.job_id,
            child,
            events: tx,
            cancel,
            max_duration: self.config.max_duration,
            workspace,
            artifacts: self.artifacts.clone(),
        };
        let outcome = tokio::spawn(supervisor.run(BufReader::new(stdout), stderr_task));

        Ok(ExecutionHandle {
            events: rx,
            outcome,
        })
    }
}

enum Stop {
    Eof,
    Exited(ExitStatus),
    Cancelled,
    TimedOut,
    Broken(String),
}

/// Owns the child process and its workspace for the lifetime of one run.
struct Supervisor {
    job_id: Uuid,
    child: Child,
    events: mpsc::Sender<ExecutionEvent>,
    cancel: CancellationToken,
    max_duration: Duration,
    workspace: Workspace,
    artifacts: Option<ArtifactStore>,
}

impl Supervisor {
    async fn run<R>(mut self, mut stdout: R, mut stderr: JoinHandle<bool>) -> ExecutionOutcome
    where
        R: AsyncBufRead + Unpin,
    {
        let deadline = tokio::time::sleep(self.max_duration);
        tokio::pin!(deadline);
        let mut parser = EventParser::new();
        let mut buf = Vec::new();

        let mut stop = 'read: loop {
            buf.clear();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Stop::Cancelled,
                _ = &mut deadline => break Stop::TimedOut,
                read = stdout.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => break Stop::Eof,
                    Ok(_) => {
                        for event in parser.feed(&String::from_utf8_lossy(&buf)) {
                            if self.events.send(event).await.is_err() {
                                break 'read Stop::Broken("event consumer went away".to_string());
                            }
                        }
                    }
                    Err(e) => break Stop::Broken(format!("failed to read output: {}", e)),
                }
            }
        };

        if let Stop::Eof = stop {
            if let Some(event) = parser.finish() {
                self.emit(event).await;
            }
            stop = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Stop::Cancelled,
                _ = &mut deadline => Stop::TimedOut,
                waited = self.child.wait() => match waited {
                    Ok(exit) => Stop::Exited(exit),
                    Err(e) => Stop::Broken(format!("failed to wait for process: {}", e)),
                },
            };
        }

        let outcome = match stop {
            Stop::Exited(exit) => {
                let stderr_fatal =
                    match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut stderr).await {
                        Ok(Ok(saw_fatal)) => saw_fatal,
                        _ => false,
                    };
                stderr.abort();
                self.exited(exit, parser.saw_recap(), parser.saw_fatal() || stderr_fatal)
                    .await
            }
            Stop::Cancelled => {
                stderr.abort();
                self.kill().await;
                tracing::info!(job_id = %self.job_id, "Execution cancelled, process terminated");
                ExecutionOutcome {
                    exit_code: None,
                    termination: Termination::Cancelled,
                    artifacts: None,
                }
            }
            Stop::TimedOut => {
                stderr.abort();
                self.kill().await;
                let secs = self.max_duration.as_secs();
                tracing::warn!(job_id = %self.job_id, max_secs = secs, "Execution timed out");
                self.emit(ExecutionEvent::fatal(format!(
                    "execution exceeded maximum duration of {}s",
                    secs
                )))
                .await;
                ExecutionOutcome {
                    exit_code: None,
                    termination: Termination::TimedOut {
                        limit: self.max_duration,
                    },
                    artifacts: None,
                }
            }
            Stop::Broken(message) => {
                stderr.abort();
                self.crash(message).await
            }
            Stop::Eof => {
                stderr.abort();
                self.crash("output ended without an exit status".to_string())
                    .await
            }
        };

        self.release(outcome)
    }

    async fn exited(
        &mut self,
        exit: ExitStatus,
        saw_recap: bool,
        saw_fatal: bool,
    ) -> ExecutionOutcome {
        let Some(code) = exit.code() else {
            return self.crashed(describe_signal(exit)).await;
        };
        tracing::info!(job_id = %self.job_id, exit_code = code, "Playbook process exited");
        if code != 0 && !saw_recap && !saw_fatal {
            self.emit(ExecutionEvent::fatal(format!(
                "process exited with code {} before completing the run",
                code
            )))
            .await;
        }
        ExecutionOutcome {
            exit_code: Some(code),
            termination: Termination::Exited,
            artifacts: None,
        }
    }

    async fn crash(&mut self, message: String) -> ExecutionOutcome {
        self.kill().await;
        self.crashed(message).await
    }

    /// Report a process that is already gone.
    async fn crashed(&self, message: String) -> ExecutionOutcome {
        tracing::error!(job_id = %self.job_id, reason = %message, "Execution crashed");
        self.emit(ExecutionEvent::fatal(message.clone())).await;
        ExecutionOutcome::crashed(message)
    }

    async fn emit(&self, event: ExecutionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!(job_id = %self.job_id, "Event dropped, consumer gone");
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to kill playbook process");
        }
    }

    /// Persist artifacts and remove the workspace. Dropping `self` also
    /// closes the event channel.
    fn release(self, mut outcome: ExecutionOutcome) -> ExecutionOutcome {
        if let Some(store) = &self.artifacts {
            match store.persist(self.job_id, &self.workspace, outcome.exit_code) {
                Ok(path) => outcome.artifacts = Some(path),
                Err(e) => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "Failed to persist artifacts")
                }
            }
        }
        let job_id = self.job_id;
        if let Err(e) = self.workspace.close() {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to remove workspace");
        }
        outcome
    }
}

fn describe_signal(exit: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match exit.signal() {
        Some(signal) => format!("process terminated by signal {}", signal),
        None => "process terminated without an exit code".to_string(),
    }
}

/// Forward stderr as events. Returns whether a tool error was seen.
async fn forward_stderr<R>(mut reader: R, events: mpsc::Sender<ExecutionEvent>) -> bool
where
    R: AsyncBufRead + Unpin,
{
    let mut parser = EventParser::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                for event in parser.feed(&String::from_utf8_lossy(&buf)) {
                    if events.send(event).await.is_err() {
                        return parser.saw_fatal();
                    }
                }
            }
        }
    }
    if let Some(event) = parser.finish() {
        let _ = events.send(event).await;
    }
    parser.saw_fatal()
}
