use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use runbook_lite::audit::TracingAuditSink;
use runbook_lite::catalog::{Catalog, InMemoryCatalog, VarMap};
use runbook_lite::config::{ArtifactConfig, ExecutorConfig, NodeConfig};
use runbook_lite::logs::LogLevel;
use runbook_lite::node::Node;
use runbook_lite::scheduler::{Job, JobRequest, JobStatus};
use runbook_lite::shutdown::{drain_workers, install_shutdown_handler};
use runbook_lite::worker::workspace::render_inventory;

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const DRAIN_GRACE: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "runbook-lite")]
#[command(version)]
#[command(about = "Run playbooks against servers and follow their logs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a playbook against a server and follow its log until it finishes
    Run(RunArgs),

    /// Print the inventory that would be generated for a server
    Inventory {
        #[command(flatten)]
        catalog: CatalogArgs,

        /// Server ID from the catalog
        #[arg(long)]
        server: u64,

        /// Directory that relative private key paths are resolved against
        #[arg(long)]
        private_key_dir: Option<PathBuf>,
    },
}

#[derive(Parser, Debug)]
struct CatalogArgs {
    /// Path to the JSON catalog of playbooks and servers
    #[arg(long, short = 'c')]
    catalog: PathBuf,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    catalog: CatalogArgs,

    /// Playbook ID from the catalog
    #[arg(long)]
    playbook: u64,

    /// Server ID from the catalog
    #[arg(long)]
    server: u64,

    /// Who is starting the job
    #[arg(long, default_value = "cli")]
    initiator: String,

    /// Extra variable (repeatable), format: "key=value". Values are parsed as
    /// JSON when possible, otherwise kept as strings.
    #[arg(long = "var", short = 'e')]
    vars: Vec<String>,

    /// Program to run instead of ansible-playbook
    #[arg(long, default_value = "ansible-playbook")]
    program: PathBuf,

    /// Argument placed before the generated ones (repeatable)
    #[arg(long = "program-arg", allow_hyphen_values = true)]
    program_args: Vec<String>,

    /// Parent directory for per-job workspaces
    #[arg(long, default_value = "/var/lib/runbook-lite/runner")]
    runner_dir: PathBuf,

    /// Directory that relative private key paths are resolved against
    #[arg(long)]
    private_key_dir: Option<PathBuf>,

    /// Maximum run time in seconds
    #[arg(long, default_value = "3600")]
    max_duration_secs: u64,

    /// Keep inventory, variables and return code under this directory
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,

    /// Number of artifact directories to keep
    #[arg(long, default_value = "50", requires = "artifacts_dir")]
    keep_artifacts: usize,

    /// Run the tool verbosely and keep DEBUG log lines
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Output format for the final job summary
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobOutput<'a> {
    job: &'a Job,
    failure_message: Option<String>,
    log_lines: u64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_vars(raw: &[String]) -> Result<VarMap, Box<dyn std::error::Error>> {
    let mut vars = VarMap::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid --var '{}', expected key=value", pair))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("invalid --var '{}', empty key", pair).into());
        }
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        vars.insert(key.to_string(), value);
    }
    Ok(vars)
}

fn print_job(
    job: &Job,
    log_lines: u64,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            let output = JobOutput {
                job,
                failure_message: job.failure.as_ref().map(|f| f.to_string()),
                log_lines,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!();
            println!("Job ID:       {}", job.job_id);
            println!("Status:       {}", job.status);
            if let Some(exit_code) = job.exit_code {
                println!("Exit Code:    {}", exit_code);
            }
            if let Some(duration) = job.duration() {
                println!("Duration:     {:.1}s", duration.num_milliseconds() as f64 / 1000.0);
            }
            if let Some(failure) = &job.failure {
                println!("Reason:       {}", failure);
            }
            if let Some(requester) = &job.cancelled_by {
                println!("Cancelled By: {}", requester);
            }
            if let Some(artifacts) = &job.artifacts {
                println!("Artifacts:    {}", artifacts.display());
            }
            println!("Log Lines:    {}", log_lines);
        }
    }
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_run(args: RunArgs) -> Result<bool, Box<dyn std::error::Error>> {
    let catalog: Arc<dyn Catalog> = Arc::new(InMemoryCatalog::load(&args.catalog.catalog)?);
    let extra_vars = parse_vars(&args.vars)?;

    let mut executor = ExecutorConfig::new(args.runner_dir)
        .with_program(args.program, args.program_args)
        .with_max_duration(Duration::from_secs(args.max_duration_secs));
    executor.private_key_dir = args.private_key_dir;
    executor.verbose = args.verbose;
    if let Some(dir) = args.artifacts_dir {
        executor = executor.with_artifacts(ArtifactConfig {
            dir,
            keep: args.keep_artifacts,
        });
    }
    let config = NodeConfig::new(executor).with_workers(1);

    let node = Node::new(config, catalog, Arc::new(TracingAuditSink));
    let shutdown = install_shutdown_handler()?;
    let workers = node.start(shutdown.clone());

    let request =
        JobRequest::new(args.playbook, args.server, args.initiator).with_extra_vars(extra_vars);
    let job = node.create_job(request).await?;
    tracing::info!(job_id = %job.job_id, "Following job log");

    let mut next_line = 0;
    let mut cancel_sent = false;
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let final_job = loop {
        tokio::select! {
            _ = shutdown.cancelled(), if !cancel_sent => {
                cancel_sent = true;
                let outcome = node.cancel(&job.job_id, "cli").await?;
                tracing::info!(status = %outcome.status(), "Cancel requested from terminal");
            }
            _ = interval.tick() => {}
        }

        let status = node
            .get_job(&job.job_id)
            .await
            .map(|j| j.status)
            .unwrap_or(JobStatus::Pending);
        let page = node.get_logs(&job.job_id, next_line, None).await?;
        for entry in &page.entries {
            match entry.level {
                LogLevel::Error | LogLevel::Warning => {
                    println!("{:>5} {:<7} {}", entry.line_number, entry.level, entry.content)
                }
                LogLevel::Info | LogLevel::Debug => {
                    println!("{:>5}         {}", entry.line_number, entry.content)
                }
            }
        }
        next_line = page.next_line;

        // Keep polling until the terminal status has been observed with no
        // lines left behind it.
        if status.is_terminal() && !page.has_more {
            match node.get_job(&job.job_id).await {
                Some(job) => break job,
                None => return Err(format!("job {} disappeared", job.job_id).into()),
            }
        }
    };

    print_job(&final_job, next_line, &args.output)?;

    shutdown.cancel();
    drain_workers(workers, DRAIN_GRACE).await;
    Ok(final_job.status == JobStatus::Success)
}

fn handle_inventory(
    catalog: CatalogArgs,
    server_id: u64,
    private_key_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = InMemoryCatalog::load(&catalog.catalog)?;
    let server = catalog
        .server(server_id)
        .ok_or_else(|| format!("Server with ID {} not found", server_id))?;
    if !server.is_active {
        eprintln!("Warning: server {} is inactive", server_id);
    }
    print!("{}", render_inventory(&server, private_key_dir.as_deref())?);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Run(run_args) => {
            if !handle_run(run_args).await? {
                std::process::exit(1);
            }
        }
        Commands::Inventory {
            catalog,
            server,
            private_key_dir,
        } => {
            handle_inventory(catalog, server, private_key_dir)?;
        }
    }

    Ok(())
}
