//! Execution state models

use crate::artifacts::Artifact;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Overall pipeline execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Pipeline has not started
    Pending,
    /// Pipeline is currently running
    Running,
    /// No job affecting the verdict failed
    Success,
    /// A job affecting the verdict failed or was blocked by a failure
    Failed,
    /// Pipeline was aborted
    Cancelled,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Why a job did not run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Trigger rule evaluated to Skip
    Rule,
    /// A dependency (or an earlier stage) did not complete
    Blocked {
        dependency: String,
        due_to_failure: bool,
    },
    /// A dependency's artifact was missing or had expired
    ArtifactUnavailable { dependency: String, expired: bool },
}

impl SkipReason {
    /// Whether the skip traces back to a failed job
    pub fn caused_by_failure(&self) -> bool {
        match self {
            SkipReason::Rule => false,
            SkipReason::Blocked { due_to_failure, .. } => *due_to_failure,
            SkipReason::ArtifactUnavailable { .. } => true,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Rule => write!(f, "trigger rule"),
            SkipReason::Blocked {
                dependency,
                due_to_failure: true,
            } => write!(f, "blocked: '{}' failed", dependency),
            SkipReason::Blocked { dependency, .. } => {
                write!(f, "blocked: '{}' did not run", dependency)
            }
            SkipReason::ArtifactUnavailable {
                dependency,
                expired: true,
            } => write!(f, "artifact of '{}' expired", dependency),
            SkipReason::ArtifactUnavailable { dependency, .. } => {
                write!(f, "artifact of '{}' not found", dependency)
            }
        }
    }
}

/// How a job ended up failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCause {
    /// The body exited non-zero, timed out or could not be started
    Execution,
    /// A manual gate was rejected
    ApprovalRejected,
}

/// State of a single job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for its stage or dependencies
    Pending,
    /// Body is running
    Running {
        started_at: DateTime<Utc>,
        attempt: usize,
    },
    /// Manual gate waiting for approval; holds no worker slot
    ManualPending { since: DateTime<Utc> },
    /// Manual gate approved, runs once its dependencies allow
    Approved,
    Succeeded {
        attempts: usize,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        output: String,
    },
    Failed {
        error: String,
        attempts: usize,
        failed_at: DateTime<Utc>,
        cause: FailureCause,
    },
    Skipped { reason: SkipReason },
    Cancelled { at: DateTime<Utc> },
}

impl JobState {
    /// Check if job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded { .. }
                | JobState::Failed { .. }
                | JobState::Skipped { .. }
                | JobState::Cancelled { .. }
        )
    }

    /// Short lowercase name
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running { .. } => "running",
            JobState::ManualPending { .. } => "manual",
            JobState::Approved => "approved",
            JobState::Succeeded { .. } => "success",
            JobState::Failed { .. } => "failed",
            JobState::Skipped { .. } => "skipped",
            JobState::Cancelled { .. } => "cancelled",
        }
    }
}

/// Operator decision on a manual gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// External approval signal for a manual job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSignal {
    pub job: String,
    pub decision: ApprovalDecision,
}

/// Overall pipeline state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    /// Run ID of the latest execution
    pub run_id: Option<Uuid>,

    /// Current execution status
    pub status: ExecutionStatus,

    /// When execution started
    pub started_at: Option<DateTime<Utc>>,

    /// When the last execution pass returned
    pub completed_at: Option<DateTime<Utc>>,

    /// Total number of jobs
    pub total_jobs: usize,

    /// Number of jobs in a terminal state
    pub finished_jobs: usize,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineState {
    /// Create a new pipeline state
    pub fn new() -> Self {
        Self {
            run_id: None,
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            total_jobs: 0,
            finished_jobs: 0,
        }
    }

    /// Mark pipeline as started; a resumed run keeps its first start time
    pub fn start(&mut self, run_id: Uuid, total_jobs: usize) {
        self.run_id = Some(run_id);
        self.status = ExecutionStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
        self.completed_at = None;
        self.total_jobs = total_jobs;
    }

    /// Record the verdict of an execution pass
    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == ExecutionStatus::Cancelled
    }

    /// Calculate progress (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_jobs == 0 {
            return 0.0;
        }
        self.finished_jobs as f64 / self.total_jobs as f64
    }
}

/// Per-job entry in a pipeline result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub name: String,
    pub stage: String,
    /// Label of the job's state
    pub status: String,
    pub attempts: usize,
    pub allow_failure: bool,
    /// False for allow_failure failures, which report their true status
    /// without changing the verdict
    pub affects_verdict: bool,
    /// Error, skip reason or output summary
    pub detail: Option<String>,
}

/// Outcome of running (or resuming) a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: ExecutionStatus,
    pub jobs: BTreeMap<String, JobReport>,
    /// Artifacts published in this run, keyed by producing job
    #[serde(skip)]
    pub artifacts: BTreeMap<String, Arc<Artifact>>,
    /// Manual jobs still waiting for a decision
    pub awaiting_approval: Vec<String>,
}

impl PipelineResult {
    pub fn job(&self, name: &str) -> Option<&JobReport> {
        self.jobs.get(name)
    }

    /// Label of a job's state, e.g. "success" or "skipped"
    pub fn job_status(&self, name: &str) -> Option<&str> {
        self.jobs.get(name).map(|report| report.status.as_str())
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn count(&self, status: &str) -> usize {
        self.jobs.values().filter(|r| r.status == status).count()
    }
}
