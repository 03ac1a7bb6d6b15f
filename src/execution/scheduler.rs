//! Stage scheduler - decides which jobs may start and predicts a run's plan

use crate::core::{
    condition::{try_evaluate, RuleDecision},
    Job, JobState, Pipeline, PipelineContext, When,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Semaphore;

/// Strategy for scheduling job execution within a stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchedulingStrategy {
    /// One job at a time
    Sequential,

    /// Every ready job at once
    #[default]
    Parallel,

    /// At most N concurrent jobs
    LimitedParallel(usize),
}

impl SchedulingStrategy {
    /// Size of the worker pool
    pub fn worker_permits(&self) -> usize {
        match self {
            SchedulingStrategy::Sequential => 1,
            SchedulingStrategy::Parallel => Semaphore::MAX_PERMITS,
            SchedulingStrategy::LimitedParallel(max) => (*max).max(1),
        }
    }
}

/// What later stages do while a manual gate is pending
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManualGatePolicy {
    /// Later stages run; only dependents of the gate wait
    #[default]
    Proceed,
    /// Stop after the stage holding the gate until it is resolved
    Block,
}

/// Whether a job may start now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// A dependency has not finished
    Waiting,
    /// A dependency (or an earlier stage) cannot be satisfied
    Blocked {
        dependency: String,
        due_to_failure: bool,
    },
    Cancelled,
}

/// Predicted handling of a job for a given context
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Disposition {
    Run,
    /// Waits for approval before running
    Manual,
    /// Trigger rule skips the job (or could not be evaluated)
    Skip { reason: String },
    /// A dependency will not run
    Blocked { dependency: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
    pub name: String,
    pub disposition: Disposition,
    pub rule: String,
    pub dependencies: Vec<String>,
    pub allow_failure: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StagePlan {
    pub name: String,
    pub index: usize,
    pub jobs: Vec<PlannedJob>,
}

/// Per-stage prediction of a run, computed without executing anything
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub pipeline: String,
    pub stages: Vec<StagePlan>,
}

impl ExecutionPlan {
    pub fn job(&self, name: &str) -> Option<&PlannedJob> {
        self.stages
            .iter()
            .flat_map(|stage| stage.jobs.iter())
            .find(|job| job.name == name)
    }

    /// Jobs that would run automatically or after approval
    pub fn runnable(&self) -> usize {
        self.stages
            .iter()
            .flat_map(|stage| stage.jobs.iter())
            .filter(|job| matches!(job.disposition, Disposition::Run | Disposition::Manual))
            .count()
    }
}

/// Scheduler for deciding which jobs to run
#[derive(Debug, Clone, Default)]
pub struct StageScheduler {
    strategy: SchedulingStrategy,
}

impl StageScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// First job of an earlier stage that failed the pipeline
    pub fn stage_barrier<'a>(&self, pipeline: &'a Pipeline, stage: usize) -> Option<&'a Job> {
        pipeline
            .execution_order()
            .iter()
            .filter_map(|name| pipeline.job(name))
            .find(|job| job.stage < stage && job.affects_verdict())
    }

    /// Decide whether a job may start given the current job states
    pub fn readiness(&self, job: &Job, pipeline: &Pipeline) -> Readiness {
        if pipeline.state.is_cancelled() {
            return Readiness::Cancelled;
        }

        if let Some(failed) = self.stage_barrier(pipeline, job.stage) {
            return Readiness::Blocked {
                dependency: failed.name.clone(),
                due_to_failure: true,
            };
        }

        let mut waiting = false;
        for name in &job.dependencies {
            let Some(dependency) = pipeline.job(name) else {
                return Readiness::Blocked {
                    dependency: name.clone(),
                    due_to_failure: false,
                };
            };

            if dependency.satisfies_dependents() {
                continue;
            }

            match &dependency.state {
                // A rejected gate with allow_failure blocks without failing
                JobState::Failed { .. } => {
                    return Readiness::Blocked {
                        dependency: name.clone(),
                        due_to_failure: !dependency.allow_failure,
                    }
                }
                JobState::Skipped { reason } => {
                    return Readiness::Blocked {
                        dependency: name.clone(),
                        due_to_failure: reason.caused_by_failure(),
                    }
                }
                JobState::Cancelled { .. } => return Readiness::Cancelled,
                _ => waiting = true,
            }
        }

        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    /// Predict what a run with this context would do
    pub fn plan(&self, pipeline: &Pipeline, ctx: &PipelineContext) -> ExecutionPlan {
        let rule_ctx = ctx.with_defaults(&pipeline.variables);
        let mut dispositions: HashMap<&str, Disposition> = HashMap::new();

        // Execution order puts dependencies first
        for name in pipeline.execution_order() {
            let Some(job) = pipeline.job(name) else {
                continue;
            };

            let disposition = match try_evaluate(&job.rule, &rule_ctx) {
                Ok(RuleDecision::Skip) => Disposition::Skip {
                    reason: "trigger rule".to_string(),
                },
                Err(e) => Disposition::Skip {
                    reason: e.to_string(),
                },
                Ok(RuleDecision::Run) => {
                    let blocked = job.dependencies.iter().find(|dep| {
                        matches!(
                            dispositions.get(dep.as_str()),
                            Some(Disposition::Skip { .. } | Disposition::Blocked { .. }) | None
                        )
                    });
                    match (blocked, job.when) {
                        (Some(dep), _) => Disposition::Blocked {
                            dependency: dep.clone(),
                        },
                        (None, When::Manual) => Disposition::Manual,
                        (None, When::OnSuccess) => Disposition::Run,
                    }
                }
            };

            dispositions.insert(name.as_str(), disposition);
        }

        let stages = pipeline
            .stages
            .stages()
            .iter()
            .map(|stage| StagePlan {
                name: stage.name.clone(),
                index: stage.index,
                jobs: pipeline
                    .jobs_in_stage(stage.index)
                    .into_iter()
                    .map(|job| PlannedJob {
                        name: job.name.clone(),
                        disposition: dispositions
                            .get(job.name.as_str())
                            .cloned()
                            .unwrap_or(Disposition::Run),
                        rule: job.rule.describe(),
                        dependencies: job.dependencies.clone(),
                        allow_failure: job.allow_failure,
                    })
                    .collect(),
            })
            .collect();

        ExecutionPlan {
            pipeline: pipeline.name.clone(),
            stages,
        }
    }
}
