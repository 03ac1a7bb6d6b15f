//! Job body execution seam

pub mod config;
pub mod shell;

pub use config::ShellRunnerConfig;
pub use shell::ShellRunner;

use crate::artifacts::Artifact;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Error types for job runners
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start job body: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Everything a runner needs to execute one attempt of a job
#[derive(Debug, Clone)]
pub struct JobInvocation {
    pub run_id: Uuid,
    pub job: String,
    pub stage: String,
    /// 1-based attempt number
    pub attempt: usize,
    pub script: Vec<String>,
    pub variables: HashMap<String, String>,
    /// Artifacts of the job's dependencies, keyed by producing job
    pub inputs: BTreeMap<String, Arc<Artifact>>,
    /// Paths to collect after a successful run
    pub artifact_paths: Vec<String>,
}

/// What a job body produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    pub exit_code: i32,
    pub log: String,
    /// Collected artifact files: relative path -> contents
    pub files: BTreeMap<String, Vec<u8>>,
}

impl JobOutput {
    pub fn success(log: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            log: log.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn failure(exit_code: i32, log: impl Into<String>) -> Self {
        Self {
            exit_code,
            log: log.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Trait for running job bodies - allows for different implementations
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run one attempt of a job body
    async fn run(&self, invocation: &JobInvocation) -> Result<JobOutput, RunnerError>;
}
