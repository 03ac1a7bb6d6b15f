//! Test utilities for pipeline scenarios

use async_trait::async_trait;
use stagehand::core::config::PipelineConfig;
use stagehand::core::{Pipeline, PipelineContext, PipelineResult};
use stagehand::execution::{ExecutionEngine, ExecutionEvent, SchedulingStrategy};
use stagehand::runner::{JobInvocation, JobOutput, JobRunner, RunnerError};
use stagehand::Artifact;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted behaviour of one job
#[derive(Debug, Clone, Default)]
struct JobScript {
    /// Exit codes for successive attempts; later attempts exit 0
    exit_codes: Vec<i32>,
    files: BTreeMap<String, Vec<u8>>,
    delay: Option<Duration>,
}

/// One recorded runner call
#[derive(Debug, Clone)]
pub struct Call {
    pub job: String,
    pub attempt: usize,
    pub variables: HashMap<String, String>,
    pub inputs: BTreeMap<String, Arc<Artifact>>,
}

/// Runner with per-job scripted exit codes, output files and delays
#[derive(Clone, Default)]
pub struct MockRunner {
    scripts: Arc<Mutex<HashMap<String, JobScript>>>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, job: &str, edit: impl FnOnce(&mut JobScript)) {
        let mut scripts = self.scripts.lock().unwrap();
        edit(scripts.entry(job.to_string()).or_default());
    }

    /// Exit codes for the first attempts of `job`
    pub fn exit_codes(self, job: &str, codes: Vec<i32>) -> Self {
        self.script(job, |script| script.exit_codes = codes);
        self
    }

    /// Fail every attempt of `job`
    pub fn always_fail(self, job: &str) -> Self {
        self.exit_codes(job, vec![1; 32])
    }

    /// File the job leaves in its working directory
    pub fn produce(self, job: &str, path: &str, contents: &str) -> Self {
        self.script(job, |script| {
            script
                .files
                .insert(path.to_string(), contents.as_bytes().to_vec());
        });
        self
    }

    pub fn delay(self, job: &str, delay: Duration) -> Self {
        self.script(job, |script| script.delay = Some(delay));
        self
    }

    /// Every call, in the order the runner saw them
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Jobs in the order they first ran
    pub fn ran(&self) -> Vec<String> {
        let mut order = Vec::new();
        for call in self.calls() {
            if !order.contains(&call.job) {
                order.push(call.job);
            }
        }
        order
    }

    pub fn attempts(&self, job: &str) -> usize {
        self.calls().iter().filter(|call| call.job == job).count()
    }

    /// Last call made for a job
    pub fn last_call(&self, job: &str) -> Option<Call> {
        self.calls().into_iter().rev().find(|call| call.job == job)
    }
}

#[async_trait]
impl JobRunner for MockRunner {
    async fn run(&self, invocation: &JobInvocation) -> Result<JobOutput, RunnerError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&invocation.job)
            .cloned()
            .unwrap_or_default();

        self.calls.lock().unwrap().push(Call {
            job: invocation.job.clone(),
            attempt: invocation.attempt,
            variables: invocation.variables.clone(),
            inputs: invocation.inputs.clone(),
        });

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }

        let exit_code = script
            .exit_codes
            .get(invocation.attempt - 1)
            .copied()
            .unwrap_or(0);
        if exit_code != 0 {
            return Ok(JobOutput::failure(
                exit_code,
                format!("{} failed on attempt {}", invocation.job, invocation.attempt),
            ));
        }

        // Only declared paths are collected, as a real workspace would be
        let files = script
            .files
            .into_iter()
            .filter(|(path, _)| {
                invocation
                    .artifact_paths
                    .iter()
                    .any(|declared| path.starts_with(declared.as_str()))
            })
            .collect();

        Ok(JobOutput {
            exit_code: 0,
            log: format!("{} done", invocation.job),
            files,
        })
    }
}

pub fn pipeline(yaml: &str) -> Pipeline {
    PipelineConfig::from_yaml(yaml)
        .expect("Should parse YAML")
        .to_pipeline()
        .expect("Should build pipeline")
}

pub fn engine(runner: MockRunner) -> ExecutionEngine<MockRunner> {
    ExecutionEngine::new(runner, SchedulingStrategy::Sequential)
}

/// Collect every event the engine emits
pub async fn record_events(engine: &ExecutionEngine<MockRunner>) -> Arc<Mutex<Vec<ExecutionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine
        .add_event_handler(move |event| sink.lock().unwrap().push(event))
        .await;
    events
}

pub fn push_to_main() -> PipelineContext {
    PipelineContext::for_push("main", "4f2a9c1")
}

pub fn assert_job(result: &PipelineResult, job: &str, status: &str) {
    assert_eq!(
        result.job_status(job),
        Some(status),
        "job {} ended as {:?}: {:?}",
        job,
        result.job_status(job),
        result.job(job).and_then(|report| report.detail.clone())
    );
}
