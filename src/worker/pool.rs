use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scheduler::ClaimQueue;
use crate::worker::controller::JobController;

/// Start `count` workers pulling from the shared claim queue.
///
/// A worker finishes the job it is executing before it observes shutdown.
pub fn spawn_workers(
    count: usize,
    queue: ClaimQueue,
    controller: Arc<JobController>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker_id| {
            let queue = queue.clone();
            let controller = controller.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, queue, controller, shutdown).await;
            })
        })
        .collect()
}

async fn worker_loop(
    worker_id: usize,
    queue: ClaimQueue,
    controller: Arc<JobController>,
    shutdown: CancellationToken,
) {
    tracing::debug!(worker_id, "Worker started");
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = queue.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        tracing::debug!(worker_id, job_id = %message.job_id, "Claim received");
        controller.process(message).await;
    }
    tracing::debug!(worker_id, "Worker stopped");
}
