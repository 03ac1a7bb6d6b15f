//! Job executor - runs a job body with retries and a timeout

use crate::{
    core::{Job, PipelineError},
    execution::events::{EventBus, ExecutionEvent},
    runner::{JobInvocation, JobOutput, JobRunner, RunnerError},
};
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

/// Result of executing a job
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Success { output: JobOutput, attempts: usize },
    /// Every attempt failed
    Failed {
        error: PipelineError,
        attempts: usize,
    },
}

/// Executes a single job
pub struct JobExecutor<R> {
    runner: R,
}

impl<R: JobRunner> JobExecutor<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run a job until it succeeds or its attempts are used up
    pub async fn run(
        &self,
        job: &Job,
        mut invocation: JobInvocation,
        events: &EventBus,
    ) -> ExecutionOutcome {
        let max_attempts = job.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            invocation.attempt = attempt;
            if attempt > 1 {
                info!("Retrying job {} (attempt {}/{})", job.name, attempt, max_attempts);
                events
                    .emit(ExecutionEvent::JobRetrying {
                        job: job.name.clone(),
                        attempt,
                        max_attempts,
                    })
                    .await;
            }
            events
                .emit(ExecutionEvent::JobStarted {
                    job: job.name.clone(),
                    attempt,
                })
                .await;

            let timeout_duration = Duration::from_secs(job.timeout_secs);
            match timeout(timeout_duration, self.runner.run(&invocation)).await {
                Ok(Ok(output)) => {
                    if !output.log.is_empty() {
                        events
                            .emit(ExecutionEvent::JobOutput {
                                job: job.name.clone(),
                                log: output.log.clone(),
                            })
                            .await;
                    }
                    if output.succeeded() {
                        info!("Job {} succeeded on attempt {}", job.name, attempt);
                        return ExecutionOutcome::Success {
                            output,
                            attempts: attempt,
                        };
                    }
                    warn!("Job {} exited with code {}", job.name, output.exit_code);
                    last_error = format!("exit code {}", output.exit_code);
                }
                Ok(Err(e)) => {
                    error!("Runner error for job {}: {}", job.name, e);
                    last_error = e.to_string();
                }
                Err(_) => {
                    error!("Timeout for job {} after {}s", job.name, job.timeout_secs);
                    last_error = RunnerError::Timeout(job.timeout_secs).to_string();
                }
            }
        }

        ExecutionOutcome::Failed {
            error: PipelineError::ExecutionFailure {
                job: job.name.clone(),
                attempts: max_attempts,
                message: last_error,
            },
            attempts: max_attempts,
        }
    }
}
