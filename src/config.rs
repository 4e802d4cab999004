use std::path::PathBuf;
use std::time::Duration;

/// Retention of per-job execution artifacts after the scratch workspace is released.
#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    /// Directory holding one sub-directory per job UUID
    pub dir: PathBuf,
    /// Number of most recent artifact directories to keep
    pub keep: usize,
}

impl ArtifactConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keep: 50,
        }
    }
}

/// Configuration for invoking the external automation tool.
///
/// Every job runs the tool in its own scratch directory under `runner_dir`,
/// with a generated single-host inventory and a merged extra-vars file.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Program to run (e.g., "ansible-playbook")
    pub program: PathBuf,
    /// Arguments placed before the generated ones
    pub program_args: Vec<String>,
    /// Parent directory for per-job scratch workspaces
    pub runner_dir: PathBuf,
    /// Directory that relative SSH private key paths are resolved against
    pub private_key_dir: Option<PathBuf>,
    /// Maximum wall-clock duration of a single run
    pub max_duration: Duration,
    /// Capacity of the channel between the adapter and log ingestion
    pub event_buffer: usize,
    /// Run the tool verbosely and keep DEBUG-level log lines
    pub verbose: bool,
    /// Keep inventory, variables and return code after the run
    pub artifacts: Option<ArtifactConfig>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ansible-playbook"),
            program_args: Vec::new(),
            runner_dir: PathBuf::from("/var/lib/runbook-lite/runner"),
            private_key_dir: None,
            max_duration: Duration::from_secs(3600),
            event_buffer: 256,
            verbose: false,
            artifacts: None,
        }
    }
}

impl ExecutorConfig {
    pub fn new(runner_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner_dir: runner_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.program_args = args;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactConfig) -> Self {
        self.artifacts = Some(artifacts);
        self
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Number of concurrent worker loops pulling claim messages
    pub workers: usize,
    /// Capacity of the claim queue
    pub queue_capacity: usize,
    /// Maximum number of jobs kept in the job store
    pub max_jobs: usize,
    pub default_log_page: usize,
    pub max_log_page: usize,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Length of the recent failures list in statistics
    pub recent_failures_limit: usize,
    pub executor: ExecutorConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            max_jobs: 10_000,
            default_log_page: 100,
            max_log_page: 1000,
            default_page_size: 20,
            max_page_size: 100,
            recent_failures_limit: 10,
            executor: ExecutorConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(executor: ExecutorConfig) -> Self {
        Self {
            executor,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Clamp a requested log page size into `1..=max_log_page`.
    pub fn log_page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_log_page)
            .clamp(1, self.max_log_page)
    }

    /// Clamp a requested job list page size into `1..=max_page_size`.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size)
    }
}
