//! stagehand - a multi-stage CI/CD pipeline orchestration engine

pub mod artifacts;
pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod runner;

// Re-export commonly used types
pub use artifacts::{Artifact, ArtifactError, ArtifactStore, InMemoryArtifactStore};
pub use crate::core::{ExecutionStatus, Job, JobState, Pipeline, PipelineContext, PipelineResult, TriggerSource};
pub use execution::{ControlHandle, ExecutionEngine, ExecutionEvent, SchedulingStrategy};
pub use runner::{JobInvocation, JobOutput, JobRunner, RunnerError, ShellRunner};
