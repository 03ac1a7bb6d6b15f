//! Pipeline domain model

use crate::artifacts::Artifact;
use crate::core::{
    config::PipelineConfig,
    context::PipelineContext,
    error::PipelineError,
    job::{Job, JobDefaults},
    stage::StageOrder,
    state::{
        ApprovalDecision, ExecutionStatus, FailureCause, JobReport, JobState, PipelineResult,
        PipelineState,
    },
};
use crate::execution::scheduler::ManualGatePolicy;
use anyhow::Result;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

/// A pipeline definition together with the state of its current run
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    pub stages: StageOrder,

    /// Global variables from the pipeline file
    pub variables: HashMap<String, String>,

    /// Jobs keyed by name
    pub jobs: HashMap<String, Job>,

    /// Execution state
    pub state: PipelineState,

    pub manual_gate_policy: ManualGatePolicy,

    /// Decisions received for manual jobs that were not yet parked
    decisions: HashMap<String, ApprovalDecision>,

    /// Stage order, then dependencies, then name
    execution_order: Vec<String>,
}

impl Pipeline {
    /// Create a pipeline from configuration
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let stages = StageOrder::new(&config.stage_names());
        let defaults = JobDefaults::from_config(&config.defaults)?;

        let mut jobs = HashMap::new();
        for name in config.jobs.keys() {
            let spec = config.resolve_job(name)?;
            let job = Job::from_spec(name, &spec, &stages, &defaults, &config.before_script)?;
            jobs.insert(name.clone(), job);
        }

        let execution_order = Self::topological_sort(&jobs);

        Ok(Pipeline {
            name: config.name.clone(),
            stages,
            variables: config.variables_as_string_map(),
            jobs,
            state: PipelineState::new(),
            manual_gate_policy: config.manual_gate_policy,
            decisions: HashMap::new(),
            execution_order,
        })
    }

    /// Get a job by name
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.get(name)
    }

    /// Get a mutable job by name
    pub fn job_mut(&mut self, name: &str) -> Option<&mut Job> {
        self.jobs.get_mut(name)
    }

    /// Get execution order
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Jobs of one stage in execution order
    pub fn jobs_in_stage(&self, stage: usize) -> Vec<&Job> {
        self.execution_order
            .iter()
            .filter_map(|name| self.jobs.get(name))
            .filter(|job| job.stage == stage)
            .collect()
    }

    /// Names of manual jobs waiting for a decision
    pub fn awaiting_approval(&self) -> Vec<String> {
        self.execution_order
            .iter()
            .filter(|name| {
                self.jobs
                    .get(*name)
                    .is_some_and(|job| matches!(job.state, JobState::ManualPending { .. }))
            })
            .cloned()
            .collect()
    }

    /// Whether every job reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.jobs.values().all(|job| job.state.is_terminal())
    }

    /// Calculate topological sort of jobs, grouped by stage
    fn topological_sort(jobs: &HashMap<String, Job>) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();

        // Sort for deterministic order
        let mut names: Vec<&Job> = jobs.values().collect();
        names.sort_by(|a, b| a.stage.cmp(&b.stage).then_with(|| a.name.cmp(&b.name)));

        for job in names {
            Self::visit(&job.name, jobs, &mut visited, &mut result);
        }

        result
    }

    fn visit(
        name: &str,
        jobs: &HashMap<String, Job>,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(name.to_string()) {
            return;
        }

        if let Some(job) = jobs.get(name) {
            for dep in &job.dependencies {
                Self::visit(dep, jobs, visited, result);
            }
        }

        result.push(name.to_string());
    }

    /// Variables a job's body sees
    ///
    /// Pipeline globals, then job variables, then variables supplied with
    /// the trigger, then the predefined `CI_*` set.
    pub fn job_variables(&self, job: &Job, ctx: &PipelineContext) -> HashMap<String, String> {
        let mut vars = self.variables.clone();
        vars.extend(job.variables.clone());
        vars.extend(ctx.variables().clone());
        vars.extend(ctx.predefined_variables());
        vars.insert("CI_JOB_NAME".to_string(), job.name.clone());
        vars.insert("CI_JOB_STAGE".to_string(), job.stage_name.clone());
        if let Some(environment) = &job.environment {
            vars.insert("CI_ENVIRONMENT_NAME".to_string(), environment.clone());
        }
        vars
    }

    /// Approve a manual job
    ///
    /// Returns `Ok(false)` when the approval changes nothing, e.g. the job
    /// was already approved or has finished.
    pub fn approve(&mut self, name: &str) -> Result<bool, PipelineError> {
        self.decide(name, ApprovalDecision::Approve)
    }

    /// Reject a manual job; it fails without running
    pub fn reject(&mut self, name: &str) -> Result<bool, PipelineError> {
        self.decide(name, ApprovalDecision::Reject)
    }

    fn decide(&mut self, name: &str, decision: ApprovalDecision) -> Result<bool, PipelineError> {
        let job = self
            .jobs
            .get_mut(name)
            .ok_or_else(|| PipelineError::UnknownJob(name.to_string()))?;

        if !job.is_manual() {
            return Err(PipelineError::InvalidState {
                job: name.to_string(),
                state: "not manual",
                expected: "a manual job",
            });
        }

        match job.state {
            JobState::ManualPending { .. } => {
                Self::apply_decision(job, decision);
                Ok(true)
            }
            // Not parked yet: remember the first decision for when it is
            JobState::Pending => {
                if self.decisions.contains_key(name) {
                    return Ok(false);
                }
                self.decisions.insert(name.to_string(), decision);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn apply_decision(job: &mut Job, decision: ApprovalDecision) {
        match decision {
            ApprovalDecision::Approve => {
                info!("Manual job {} approved", job.name);
                job.state = JobState::Approved;
            }
            ApprovalDecision::Reject => {
                info!("Manual job {} rejected", job.name);
                job.state = JobState::Failed {
                    error: PipelineError::ApprovalRejected {
                        job: job.name.clone(),
                    }
                    .to_string(),
                    attempts: 0,
                    failed_at: Utc::now(),
                    cause: FailureCause::ApprovalRejected,
                };
            }
        }
    }

    /// Park a manual job, or apply a decision that arrived early
    ///
    /// Returns the decision that was applied, if any.
    pub fn park_manual(&mut self, name: &str) -> Option<ApprovalDecision> {
        let decision = self.decisions.remove(name);
        if let Some(job) = self.jobs.get_mut(name) {
            match decision {
                Some(decision) => Self::apply_decision(job, decision),
                None => {
                    job.state = JobState::ManualPending { since: Utc::now() };
                }
            }
        }
        decision
    }

    /// Move every unfinished job to Cancelled
    pub fn cancel_unfinished(&mut self) -> Vec<String> {
        let now = Utc::now();
        let mut cancelled = Vec::new();
        for name in &self.execution_order {
            if let Some(job) = self.jobs.get_mut(name) {
                if !job.state.is_terminal() {
                    job.state = JobState::Cancelled { at: now };
                    cancelled.push(name.clone());
                }
            }
        }
        self.decisions.clear();
        self.state.status = ExecutionStatus::Cancelled;
        cancelled
    }

    /// Refresh the finished job count
    pub fn update_progress(&mut self) {
        self.state.total_jobs = self.jobs.len();
        self.state.finished_jobs = self.jobs.values().filter(|j| j.state.is_terminal()).count();
    }

    /// Aggregate verdict over the current job states
    pub fn verdict(&self) -> ExecutionStatus {
        if self.state.is_cancelled() {
            ExecutionStatus::Cancelled
        } else if self.jobs.values().any(Job::affects_verdict) {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Success
        }
    }

    /// Build the externally visible result
    pub fn result(&self, artifacts: BTreeMap<String, Arc<Artifact>>) -> PipelineResult {
        let jobs = self
            .execution_order
            .iter()
            .filter_map(|name| self.jobs.get(name))
            .map(|job| (job.name.clone(), Self::report(job)))
            .collect();

        PipelineResult {
            run_id: self.state.run_id.unwrap_or_default(),
            pipeline: self.name.clone(),
            status: self.verdict(),
            jobs,
            artifacts,
            awaiting_approval: self.awaiting_approval(),
        }
    }

    fn report(job: &Job) -> JobReport {
        let (attempts, detail) = match &job.state {
            JobState::Running { attempt, .. } => (*attempt, None),
            JobState::Succeeded {
                attempts, output, ..
            } => (*attempts, output.lines().last().map(str::to_string)),
            JobState::Failed {
                error, attempts, ..
            } => (*attempts, Some(error.clone())),
            JobState::Skipped { reason } => (0, Some(reason.to_string())),
            _ => (0, None),
        };

        JobReport {
            name: job.name.clone(),
            stage: job.stage_name.clone(),
            status: job.state.label().to_string(),
            attempts,
            allow_failure: job.allow_failure,
            affects_verdict: job.affects_verdict(),
            detail,
        }
    }
}
