//! Main execution engine - drives a pipeline run stage by stage

use crate::{
    artifacts::{Artifact, ArtifactError, ArtifactStore, InMemoryArtifactStore},
    core::{
        condition::evaluate,
        environment::{deploy_version, EnvironmentRegistry},
        ApprovalDecision, ApprovalSignal, FailureCause, Job, JobState, Pipeline, PipelineError,
        PipelineContext, PipelineResult, RuleDecision, SkipReason,
    },
    execution::{
        events::{EventBus, ExecutionEvent},
        executor::{ExecutionOutcome, JobExecutor},
        scheduler::{ManualGatePolicy, Readiness, SchedulingStrategy, StageScheduler},
    },
    runner::{JobInvocation, JobRunner},
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
enum ControlSignal {
    Approval(ApprovalSignal),
    Cancel,
}

/// Sends approvals and cancellation to a running engine
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlSignal>,
}

impl ControlHandle {
    /// Approve a manual job
    pub fn approve(&self, job: impl Into<String>) {
        self.send(ControlSignal::Approval(ApprovalSignal {
            job: job.into(),
            decision: ApprovalDecision::Approve,
        }));
    }

    /// Reject a manual job
    pub fn reject(&self, job: impl Into<String>) {
        self.send(ControlSignal::Approval(ApprovalSignal {
            job: job.into(),
            decision: ApprovalDecision::Reject,
        }));
    }

    /// Abort the pipeline
    pub fn cancel(&self) {
        self.send(ControlSignal::Cancel);
    }

    fn send(&self, signal: ControlSignal) {
        // The receiver lives as long as the engine
        if self.tx.send(signal).is_err() {
            warn!("Execution engine is gone; control signal dropped");
        }
    }
}

type JobTaskResult = (String, ExecutionOutcome);

/// Main pipeline execution engine
pub struct ExecutionEngine<R> {
    scheduler: StageScheduler,
    executor: Arc<JobExecutor<R>>,
    artifacts: Arc<dyn ArtifactStore>,
    environments: Arc<EnvironmentRegistry>,
    events: EventBus,
    control_tx: mpsc::UnboundedSender<ControlSignal>,
    control_rx: Mutex<mpsc::UnboundedReceiver<ControlSignal>>,
}

impl<R: JobRunner + 'static> ExecutionEngine<R> {
    pub fn new(runner: R, strategy: SchedulingStrategy) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            scheduler: StageScheduler::new(strategy),
            executor: Arc::new(JobExecutor::new(runner)),
            artifacts: Arc::new(InMemoryArtifactStore::new()),
            environments: Arc::new(EnvironmentRegistry::new()),
            events: EventBus::new(),
            control_tx,
            control_rx: Mutex::new(control_rx),
        }
    }

    /// Share an artifact store between engines or with the caller
    pub fn with_artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = store;
        self
    }

    pub fn with_environments(mut self, environments: Arc<EnvironmentRegistry>) -> Self {
        self.environments = environments;
        self
    }

    pub fn artifact_store(&self) -> Arc<dyn ArtifactStore> {
        Arc::clone(&self.artifacts)
    }

    pub fn environments(&self) -> Arc<EnvironmentRegistry> {
        Arc::clone(&self.environments)
    }

    pub fn scheduler(&self) -> &StageScheduler {
        &self.scheduler
    }

    pub fn runner(&self) -> &R {
        self.executor.runner()
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler).await;
    }

    /// Handle for approving, rejecting and cancelling
    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// Run the pipeline, or resume it when called again with the same context
    ///
    /// Returns once every job that can make progress has, leaving manual
    /// gates without a decision (and their dependents) pending.
    pub async fn execute(&self, pipeline: &mut Pipeline, ctx: &PipelineContext) -> PipelineResult {
        let mut control = self.control_rx.lock().await;
        let run_id = ctx.run_id();

        if pipeline.state.is_cancelled() {
            warn!("Pipeline {} was cancelled; not resuming", pipeline.name);
            return pipeline.result(self.artifacts.list_run(run_id).await);
        }

        let resumed = pipeline.state.run_id == Some(run_id);
        pipeline.state.start(run_id, pipeline.jobs.len());
        if resumed {
            info!("Resuming pipeline: {} ({})", pipeline.name, run_id);
            self.events
                .emit(ExecutionEvent::PipelineResumed {
                    run_id,
                    pipeline_name: pipeline.name.clone(),
                })
                .await;
        } else {
            info!("Starting pipeline execution: {} ({})", pipeline.name, run_id);
            self.events
                .emit(ExecutionEvent::PipelineStarted {
                    run_id,
                    pipeline_name: pipeline.name.clone(),
                    total_jobs: pipeline.jobs.len(),
                })
                .await;
        }

        for job in pipeline.jobs.values() {
            if let Some(environment) = &job.environment {
                self.environments.bind(environment, &job.name).await;
            }
        }

        let purged = self.artifacts.expire(Utc::now()).await;
        if purged > 0 {
            debug!("Purged {} expired artifacts", purged);
        }

        // Rules see pipeline globals; the context's own values win
        let rule_ctx = ctx.with_defaults(&pipeline.variables);
        let semaphore = Arc::new(Semaphore::new(self.scheduler.strategy().worker_permits()));

        let mut cancelled = false;
        while let Ok(signal) = control.try_recv() {
            cancelled |= self.handle_signal(pipeline, signal).await.is_none();
        }

        // A decision that lands after its stage was passed triggers another pass
        let mut rerun = true;
        while rerun && !cancelled {
            rerun = false;

            for stage in 0..pipeline.stages.len() {
                let names: Vec<String> = pipeline
                    .jobs_in_stage(stage)
                    .iter()
                    .map(|job| job.name.clone())
                    .collect();
                if names
                    .iter()
                    .all(|name| pipeline.job(name).is_some_and(|j| j.state.is_terminal()))
                {
                    continue;
                }

                debug!("Entering stage {}", pipeline.stages.name_of(stage));
                self.events
                    .emit(ExecutionEvent::StageStarted {
                        stage: pipeline.stages.name_of(stage).to_string(),
                        index: stage,
                    })
                    .await;

                let mut tasks: JoinSet<JobTaskResult> = JoinSet::new();
                loop {
                    let mut progressed = self
                        .dispatch(pipeline, &names, &rule_ctx, ctx, &semaphore, &mut tasks)
                        .await;

                    if tasks.is_empty() {
                        progressed |= self.sweep_orphans(pipeline, &names).await;
                        if progressed {
                            continue;
                        }
                        break;
                    }

                    tokio::select! {
                        Some(joined) = tasks.join_next() => {
                            self.record(pipeline, joined, ctx).await;
                        }
                        Some(signal) = control.recv() => {
                            match self.handle_signal(pipeline, signal).await {
                                None => {
                                    cancelled = true;
                                    tasks.abort_all();
                                    while tasks.join_next().await.is_some() {}
                                    break;
                                }
                                Some(changed) => rerun |= changed,
                            }
                        }
                        else => break,
                    }
                }

                if cancelled {
                    break;
                }

                if pipeline.manual_gate_policy == ManualGatePolicy::Block
                    && names.iter().any(|name| {
                        pipeline
                            .job(name)
                            .is_some_and(|j| matches!(j.state, JobState::ManualPending { .. }))
                    })
                {
                    info!(
                        "Stage {} has pending manual jobs; later stages wait",
                        pipeline.stages.name_of(stage)
                    );
                    break;
                }
            }
        }

        if cancelled {
            info!("Pipeline {} cancelled", pipeline.name);
            for job in pipeline.cancel_unfinished() {
                self.events.emit(ExecutionEvent::JobCancelled { job }).await;
            }
        }

        pipeline.update_progress();
        let status = pipeline.verdict();
        pipeline.state.finish(status);

        let result = pipeline.result(self.artifacts.list_run(run_id).await);
        info!(
            "Pipeline execution finished: {} - {} ({} awaiting approval)",
            pipeline.name,
            status,
            result.awaiting_approval.len()
        );
        self.events
            .emit(ExecutionEvent::PipelineCompleted {
                run_id,
                status,
                awaiting_approval: result.awaiting_approval.len(),
            })
            .await;

        result
    }

    /// Apply a control signal; `None` means the pipeline was cancelled
    async fn handle_signal(&self, pipeline: &mut Pipeline, signal: ControlSignal) -> Option<bool> {
        let ApprovalSignal { job, decision } = match signal {
            ControlSignal::Cancel => return None,
            ControlSignal::Approval(approval) => approval,
        };

        let applied = match decision {
            ApprovalDecision::Approve => pipeline.approve(&job),
            ApprovalDecision::Reject => pipeline.reject(&job),
        };

        match applied {
            Ok(true) => {
                self.announce_decision(pipeline, &job).await;
                Some(true)
            }
            Ok(false) => {
                debug!("Decision for {} changed nothing", job);
                Some(false)
            }
            Err(e) => {
                warn!("Ignoring approval signal: {}", e);
                Some(false)
            }
        }
    }

    async fn announce_decision(&self, pipeline: &Pipeline, name: &str) {
        let Some(job) = pipeline.job(name) else {
            return;
        };
        match &job.state {
            JobState::Approved => {
                self.events
                    .emit(ExecutionEvent::JobApproved {
                        job: name.to_string(),
                    })
                    .await;
            }
            JobState::Failed {
                error, attempts, ..
            } => {
                self.events
                    .emit(ExecutionEvent::JobRejected {
                        job: name.to_string(),
                    })
                    .await;
                self.events
                    .emit(ExecutionEvent::JobFailed {
                        job: name.to_string(),
                        error: error.clone(),
                        attempts: *attempts,
                        allow_failure: job.allow_failure,
                    })
                    .await;
            }
            _ => debug!("Decision for {} recorded until it is reached", name),
        }
    }

    async fn skip(&self, pipeline: &mut Pipeline, name: &str, reason: SkipReason) {
        info!("Skipping job {}: {}", name, reason);
        if let Some(job) = pipeline.job_mut(name) {
            job.state = JobState::Skipped {
                reason: reason.clone(),
            };
        }
        self.events
            .emit(ExecutionEvent::JobSkipped {
                job: name.to_string(),
                reason,
            })
            .await;
    }

    /// Start or resolve every job of the stage that can move; returns
    /// whether any job changed state
    async fn dispatch(
        &self,
        pipeline: &mut Pipeline,
        names: &[String],
        rule_ctx: &PipelineContext,
        ctx: &PipelineContext,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<JobTaskResult>,
    ) -> bool {
        let mut progressed = false;

        for name in names {
            let Some(job) = pipeline.job(name) else {
                continue;
            };
            let fresh = match job.state {
                JobState::Pending => true,
                JobState::Approved => false,
                _ => continue,
            };

            if fresh && evaluate(&job.rule, rule_ctx) == RuleDecision::Skip {
                self.skip(pipeline, name, SkipReason::Rule).await;
                progressed = true;
                continue;
            }

            match self.scheduler.readiness(job, pipeline) {
                Readiness::Ready => {}
                Readiness::Waiting | Readiness::Cancelled => continue,
                Readiness::Blocked {
                    dependency,
                    due_to_failure,
                } => {
                    self.skip(
                        pipeline,
                        name,
                        SkipReason::Blocked {
                            dependency,
                            due_to_failure,
                        },
                    )
                    .await;
                    progressed = true;
                    continue;
                }
            }

            if fresh && job.is_manual() {
                progressed = true;
                match pipeline.park_manual(name) {
                    None => {
                        info!("Job {} awaits manual approval", name);
                        self.events
                            .emit(ExecutionEvent::JobAwaitingApproval { job: name.clone() })
                            .await;
                        continue;
                    }
                    Some(ApprovalDecision::Reject) => {
                        self.announce_decision(pipeline, name).await;
                        continue;
                    }
                    Some(ApprovalDecision::Approve) => {
                        self.announce_decision(pipeline, name).await;
                    }
                }
            }

            let Some(job) = pipeline.job(name).cloned() else {
                continue;
            };

            let inputs = match self.collect_inputs(pipeline, &job, ctx).await {
                Ok(inputs) => inputs,
                Err(reason) => {
                    self.skip(pipeline, name, reason).await;
                    progressed = true;
                    continue;
                }
            };

            if let Some(environment) = &job.environment {
                let version = deploy_version(ctx);
                if self.environments.is_current(environment, &version).await {
                    info!("{} already runs {}; skipping deploy body", environment, version);
                    let now = Utc::now();
                    if let Some(job) = pipeline.job_mut(name) {
                        job.state = JobState::Succeeded {
                            attempts: 0,
                            started_at: now,
                            completed_at: now,
                            output: format!("{} already deployed to {}", version, environment),
                        };
                    }
                    self.events
                        .emit(ExecutionEvent::DeploymentRecorded {
                            environment: environment.clone(),
                            job: name.clone(),
                            version,
                            unchanged: true,
                        })
                        .await;
                    self.events
                        .emit(ExecutionEvent::JobSucceeded {
                            job: name.clone(),
                            attempts: 0,
                        })
                        .await;
                    progressed = true;
                    continue;
                }
            }

            let invocation = JobInvocation {
                run_id: ctx.run_id(),
                job: job.name.clone(),
                stage: job.stage_name.clone(),
                attempt: 1,
                script: job.script.clone(),
                variables: pipeline.job_variables(&job, ctx),
                inputs,
                artifact_paths: job
                    .artifacts
                    .as_ref()
                    .map(|spec| spec.paths.clone())
                    .unwrap_or_default(),
            };

            if let Some(job) = pipeline.job_mut(name) {
                job.state = JobState::Running {
                    started_at: Utc::now(),
                    attempt: 1,
                };
            }
            progressed = true;

            let executor = Arc::clone(&self.executor);
            let events = self.events.clone();
            let semaphore = Arc::clone(semaphore);
            tasks.spawn(async move {
                // Held for the whole run, including retries
                let _permit = semaphore.acquire_owned().await;
                let outcome = executor.run(&job, invocation, &events).await;
                (job.name, outcome)
            });
        }

        progressed
    }

    /// Fetch the artifacts of a job's dependencies
    async fn collect_inputs(
        &self,
        pipeline: &Pipeline,
        job: &Job,
        ctx: &PipelineContext,
    ) -> Result<BTreeMap<String, Arc<Artifact>>, SkipReason> {
        let mut inputs = BTreeMap::new();

        for name in &job.dependencies {
            // Only a body that ran to success published anything; an allowed
            // failure or an unchanged deploy lets dependents run without input
            let published = pipeline.job(name).is_some_and(|dependency| {
                dependency.artifacts.is_some()
                    && matches!(
                        dependency.state,
                        JobState::Succeeded { attempts, .. } if attempts > 0
                    )
            });
            if !published {
                continue;
            }

            match self.artifacts.get(name, ctx.run_id()).await {
                Ok(artifact) => {
                    inputs.insert(name.clone(), artifact);
                }
                Err(e) if e.is_not_found() => {
                    let (error, expired) = match &e {
                        ArtifactError::Expired { job, expired_at } => (
                            PipelineError::ArtifactExpired {
                                job: job.clone(),
                                expired_at: *expired_at,
                            },
                            true,
                        ),
                        _ => (
                            PipelineError::DependencyUnsatisfied {
                                job: job.name.clone(),
                                dependency: name.clone(),
                                reason: e.to_string(),
                            },
                            false,
                        ),
                    };
                    warn!("Job {} cannot run: {}", job.name, error);
                    return Err(SkipReason::ArtifactUnavailable {
                        dependency: name.clone(),
                        expired,
                    });
                }
                Err(e) => {
                    error!("Artifact lookup for {} failed: {}", job.name, e);
                    return Err(SkipReason::ArtifactUnavailable {
                        dependency: name.clone(),
                        expired: false,
                    });
                }
            }
        }

        Ok(inputs)
    }

    /// Record a finished job task
    async fn record(
        &self,
        pipeline: &mut Pipeline,
        joined: Result<JobTaskResult, JoinError>,
        ctx: &PipelineContext,
    ) {
        let (name, outcome) = match joined {
            Ok(result) => result,
            Err(e) => {
                error!("Job task ended abnormally: {}", e);
                return;
            }
        };
        let Some(job) = pipeline.job(&name).cloned() else {
            return;
        };
        let started_at = match &job.state {
            JobState::Running { started_at, .. } => *started_at,
            _ => Utc::now(),
        };

        match outcome {
            ExecutionOutcome::Success { output, attempts } => {
                // Publish before the job is visible as succeeded
                if let Some(spec) = &job.artifacts {
                    let variables = pipeline.job_variables(&job, ctx);
                    let artifact = Artifact::new(
                        spec.render_name(&name, &variables),
                        &name,
                        ctx.run_id(),
                        output.files.clone(),
                        spec.expire_in,
                    );
                    match self.artifacts.put(artifact).await {
                        Ok(artifact) => {
                            self.events
                                .emit(ExecutionEvent::ArtifactPublished {
                                    job: name.clone(),
                                    name: artifact.name.clone(),
                                    files: artifact.files.len(),
                                    expires_at: artifact.expires_at,
                                })
                                .await;
                        }
                        Err(e) => warn!("Could not publish artifact of {}: {}", name, e),
                    }
                }

                if let Some(environment) = &job.environment {
                    let version = deploy_version(ctx);
                    self.environments
                        .record_deploy(environment, &name, &version)
                        .await;
                    self.events
                        .emit(ExecutionEvent::DeploymentRecorded {
                            environment: environment.clone(),
                            job: name.clone(),
                            version,
                            unchanged: false,
                        })
                        .await;
                }

                if let Some(job) = pipeline.job_mut(&name) {
                    job.state = JobState::Succeeded {
                        attempts,
                        started_at,
                        completed_at: Utc::now(),
                        output: output.log,
                    };
                }
                self.events
                    .emit(ExecutionEvent::JobSucceeded {
                        job: name,
                        attempts,
                    })
                    .await;
            }
            ExecutionOutcome::Failed { error, attempts } => {
                if job.allow_failure {
                    warn!("Job {} failed (allowed): {}", name, error);
                } else {
                    error!("Job {} failed: {}", name, error);
                }
                if let Some(job) = pipeline.job_mut(&name) {
                    job.state = JobState::Failed {
                        error: error.to_string(),
                        attempts,
                        failed_at: Utc::now(),
                        cause: FailureCause::Execution,
                    };
                }
                self.events
                    .emit(ExecutionEvent::JobFailed {
                        job: name,
                        error: error.to_string(),
                        attempts,
                        allow_failure: job.allow_failure,
                    })
                    .await;
            }
        }

        pipeline.update_progress();
    }

    /// Fail jobs left running after their task died without a result
    async fn sweep_orphans(&self, pipeline: &mut Pipeline, names: &[String]) -> bool {
        let mut swept = false;
        for name in names {
            let Some(job) = pipeline.job_mut(name) else {
                continue;
            };
            let JobState::Running { attempt, .. } = job.state else {
                continue;
            };

            let error = "job task ended without a result".to_string();
            job.state = JobState::Failed {
                error: error.clone(),
                attempts: attempt,
                failed_at: Utc::now(),
                cause: FailureCause::Execution,
            };
            let allow_failure = job.allow_failure;
            self.events
                .emit(ExecutionEvent::JobFailed {
                    job: name.clone(),
                    error,
                    attempts: attempt,
                    allow_failure,
                })
                .await;
            swept = true;
        }
        swept
    }
}
