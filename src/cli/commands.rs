//! CLI command definitions

use crate::core::{PipelineContext, TriggerSource};
use crate::execution::SchedulingStrategy;
use clap::Args;
use std::path::PathBuf;

/// What triggered the pipeline
#[derive(Debug, Args, Clone)]
pub struct ContextArgs {
    /// Branch the pipeline runs for
    #[arg(long = "ref", default_value = "main", conflicts_with = "tag")]
    pub ref_name: String,

    /// Run for a tag instead of a branch
    #[arg(long)]
    pub tag: Option<String>,

    /// Commit SHA
    #[arg(long, default_value = "0000000")]
    pub sha: String,

    /// Trigger source
    #[arg(long, value_enum, default_value_t = TriggerSourceArg::Push)]
    pub source: TriggerSourceArg,

    /// Pipeline variables (key=value), e.g. DEPLOY_TAG=v1.2.0
    #[arg(long, value_parser = parse_key_value)]
    pub variable: Vec<(String, String)>,
}

impl ContextArgs {
    pub fn to_context(&self) -> PipelineContext {
        let (ref_name, is_tag) = match &self.tag {
            Some(tag) => (tag.clone(), true),
            None => (self.ref_name.clone(), false),
        };
        PipelineContext::new(ref_name, self.sha.clone(), is_tag, self.source.into())
            .with_variables(self.variable.iter().cloned())
    }
}

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    #[command(flatten)]
    pub context: ContextArgs,

    /// Scheduling strategy
    #[arg(long, value_enum, default_value_t = SchedulingStrategyArg::Parallel)]
    pub strategy: SchedulingStrategyArg,

    /// Worker limit for the limited strategy
    #[arg(long, default_value_t = 4)]
    pub max_parallel: usize,

    /// Manual jobs to approve when they are reached
    #[arg(long)]
    pub approve: Vec<String>,

    /// Manual jobs to reject when they are reached
    #[arg(long)]
    pub reject: Vec<String>,

    /// Directory for job working directories
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunCommand {
    pub fn strategy(&self) -> SchedulingStrategy {
        match self.strategy {
            SchedulingStrategyArg::Sequential => SchedulingStrategy::Sequential,
            SchedulingStrategyArg::Parallel => SchedulingStrategy::Parallel,
            SchedulingStrategyArg::Limited => SchedulingStrategy::LimitedParallel(self.max_parallel),
        }
    }
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Predict a run without executing anything
#[derive(Debug, Args, Clone)]
pub struct PlanCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    #[command(flatten)]
    pub context: ContextArgs,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List pipelines with recorded runs
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show run counts
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show a single run
    #[arg(long)]
    pub run_id: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Scheduling strategy argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulingStrategyArg {
    Sequential,
    Parallel,
    /// Parallel up to --max-parallel jobs
    Limited,
}

/// Trigger source argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TriggerSourceArg {
    Push,
    Schedule,
    Web,
    Trigger,
    Api,
}

impl From<TriggerSourceArg> for TriggerSource {
    fn from(arg: TriggerSourceArg) -> Self {
        match arg {
            TriggerSourceArg::Push => TriggerSource::Push,
            TriggerSourceArg::Schedule => TriggerSource::Schedule,
            TriggerSourceArg::Web => TriggerSource::Web,
            TriggerSourceArg::Trigger => TriggerSource::Trigger,
            TriggerSourceArg::Api => TriggerSource::Api,
        }
    }
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
