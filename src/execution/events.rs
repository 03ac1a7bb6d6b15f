//! Execution events and the handlers that observe them

use crate::core::{ExecutionStatus, SkipReason};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        run_id: Uuid,
        pipeline_name: String,
        total_jobs: usize,
    },
    /// `execute` was called again for a run that already started
    PipelineResumed {
        run_id: Uuid,
        pipeline_name: String,
    },
    StageStarted {
        stage: String,
        index: usize,
    },
    JobStarted {
        job: String,
        attempt: usize,
    },
    JobRetrying {
        job: String,
        attempt: usize,
        max_attempts: usize,
    },
    JobOutput {
        job: String,
        log: String,
    },
    JobSucceeded {
        job: String,
        attempts: usize,
    },
    JobFailed {
        job: String,
        error: String,
        attempts: usize,
        allow_failure: bool,
    },
    JobSkipped {
        job: String,
        reason: SkipReason,
    },
    JobAwaitingApproval {
        job: String,
    },
    JobApproved {
        job: String,
    },
    JobRejected {
        job: String,
    },
    JobCancelled {
        job: String,
    },
    ArtifactPublished {
        job: String,
        name: String,
        files: usize,
        expires_at: Option<DateTime<Utc>>,
    },
    DeploymentRecorded {
        environment: String,
        job: String,
        version: String,
        /// The environment already ran this version
        unchanged: bool,
    },
    PipelineCompleted {
        run_id: Uuid,
        status: ExecutionStatus,
        awaiting_approval: usize,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Fan-out of execution events to registered handlers
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event handler
    pub async fn subscribe<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    pub async fn emit(&self, event: ExecutionEvent) {
        let handlers = self.handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}
