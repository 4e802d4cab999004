//! Job execution on worker tasks.
//!
//! - [`ExecutionAdapter`]: runs the automation tool in a per-job workspace and
//!   streams typed [`ExecutionEvent`]s over a bounded channel
//! - [`JobController`]: claims jobs, feeds events to log ingestion and
//!   decides the terminal state
//! - [`spawn_workers`]: worker loops pulling claim messages from the queue
//!
//! # Execution Flow
//!
//! 1. A worker receives a claim message and the controller moves the job
//!    from `pending` to `running` with a compare-and-set
//! 2. The controller resolves the playbook and server and launches the adapter
//! 3. Events are ingested as log lines while the controller tracks recap and
//!    fatal signals
//! 4. The controller finalizes the job once the adapter's outcome is known,
//!    unless a cancel got there first

pub mod adapter;
pub mod controller;
pub mod events;
pub mod pool;
pub mod workspace;

pub use adapter::{
    ExecutionAdapter, ExecutionHandle, ExecutionOutcome, Executor, LaunchRequest, Termination,
};
pub use controller::JobController;
pub use events::{EventParser, ExecutionEvent, HostOutcome, HostStats};
pub use pool::spawn_workers;
pub use workspace::{ArtifactStore, Workspace};
