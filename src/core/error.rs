//! Pipeline error taxonomy

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A trigger condition that could not be evaluated
///
/// Evaluation fails closed: the job owning the condition is skipped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed trigger condition '{condition}': {reason}")]
pub struct RuleEvaluationError {
    pub condition: String,
    pub reason: String,
}

/// Errors raised while scheduling and running jobs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    RuleEvaluation(#[from] RuleEvaluationError),

    #[error("job '{job}' cannot run: dependency '{dependency}' {reason}")]
    DependencyUnsatisfied {
        job: String,
        dependency: String,
        reason: String,
    },

    #[error("job '{job}' failed after {attempts} attempt(s): {message}")]
    ExecutionFailure {
        job: String,
        attempts: usize,
        message: String,
    },

    #[error("manual job '{job}' was rejected")]
    ApprovalRejected { job: String },

    #[error("artifact of job '{job}' expired at {expired_at}")]
    ArtifactExpired {
        job: String,
        expired_at: DateTime<Utc>,
    },

    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error("job '{job}' is {state}, expected {expected}")]
    InvalidState {
        job: String,
        state: &'static str,
        expected: &'static str,
    },
}
