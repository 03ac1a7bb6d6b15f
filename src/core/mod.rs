//! Core domain models for the pipeline engine
//!
//! This module defines the fundamental data structures that represent
//! pipelines, stages, jobs, trigger rules and their configuration.

pub mod config;
pub mod pipeline;
pub mod job;
pub mod stage;
pub mod condition;
pub mod context;
pub mod environment;
pub mod error;
pub mod state;

pub use pipeline::*;
pub use job::*;
pub use stage::*;
pub use condition::{RuleDecision, TriggerRule};
pub use context::*;
pub use environment::{Environment, EnvironmentRegistry};
pub use error::{PipelineError, RuleEvaluationError};
pub use state::*;
