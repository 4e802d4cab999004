//! Lifecycle transition events for an external audit sink.
//!
//! Events are emitted by the job store while it holds the write lock, so the
//! order a sink observes matches the order of the underlying state changes.
//! Delivery is at-least-once; sinks deduplicate on `(job_id, transition)`.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Created,
    Started,
    Completed,
    Cancelled,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::Created => write!(f, "created"),
            Transition::Started => write!(f, "started"),
            Transition::Completed => write!(f, "completed"),
            Transition::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub job_id: Uuid,
    pub transition: Transition,
    /// Job status right after the transition
    pub status: JobStatus,
    /// Initiator for `created`, requester for `cancelled`
    pub actor: Option<String>,
    pub at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(job_id: Uuid, transition: Transition, status: JobStatus) -> Self {
        Self {
            job_id,
            transition,
            status,
            actor: None,
            at: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// Fire-and-forget consumer of lifecycle events. Must not block.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: LifecycleEvent);
}

/// Writes lifecycle events to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: LifecycleEvent) {
        tracing::info!(
            target: "audit",
            job_id = %event.job_id,
            transition = %event.transition,
            status = %event.status,
            actor = ?event.actor,
            "Job lifecycle transition"
        );
    }
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Transitions recorded for one job, in order.
    pub fn transitions(&self, job_id: &Uuid) -> Vec<Transition> {
        self.events()
            .into_iter()
            .filter(|e| &e.job_id == job_id)
            .map(|e| e.transition)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: LifecycleEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}
