pub mod dispatcher;
pub mod job;
pub mod queue;
pub mod stats;
pub mod store;

pub use dispatcher::{JobRequest, TaskDispatcher};
pub use job::{FailureReason, Job, JobStatus, Resolution};
pub use queue::{ClaimMessage, ClaimQueue};
pub use stats::{JobStatistics, StatsScope};
pub use store::{CancelOutcome, ClaimOutcome, JobFilter, JobPage, JobStore};
