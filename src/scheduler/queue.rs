use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::{Result, RunbookError};

/// Asks some worker to claim and execute a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimMessage {
    pub job_id: Uuid,
}

/// Capacity reserved ahead of persisting a job, so the send after the
/// insert cannot fail.
pub struct ClaimPermit {
    permit: mpsc::OwnedPermit<ClaimMessage>,
}

impl ClaimPermit {
    pub fn send(self, message: ClaimMessage) {
        self.permit.send(message);
    }
}

/// Bounded work queue shared by every worker.
///
/// Delivery is at-least-once: [`ClaimQueue::publish`] may carry the same
/// message more than once, which workers tolerate because claiming is
/// idempotent.
#[derive(Debug, Clone)]
pub struct ClaimQueue {
    tx: mpsc::Sender<ClaimMessage>,
    rx: Arc<Mutex<mpsc::Receiver<ClaimMessage>>>,
}

impl ClaimQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Reserve one slot without blocking.
    pub fn reserve(&self) -> Result<ClaimPermit> {
        match self.tx.clone().try_reserve_owned() {
            Ok(permit) => Ok(ClaimPermit { permit }),
            Err(mpsc::error::TrySendError::Full(_)) => Err(RunbookError::Infrastructure(
                "claim queue is full".to_string(),
            )),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RunbookError::Infrastructure(
                "claim queue is closed".to_string(),
            )),
        }
    }

    /// Enqueue a message without blocking.
    pub fn publish(&self, message: ClaimMessage) -> Result<()> {
        self.reserve()?.send(message);
        Ok(())
    }

    /// Wait for the next message. Returns `None` once every sender is gone.
    pub async fn next(&self) -> Option<ClaimMessage> {
        self.rx.lock().await.recv().await
    }

    /// Number of messages waiting to be claimed.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}
