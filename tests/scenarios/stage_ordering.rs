//! Test: Stage ordering, failure propagation and allow_failure

use crate::helpers::*;
use stagehand::core::ExecutionStatus;
use stagehand::execution::{ExecutionEngine, ExecutionEvent, SchedulingStrategy};
use std::time::Duration;

const YAML: &str = r#"
name: "Release"
jobs:
  unit:
    stage: test
    script: ["cargo test"]
  lint:
    stage: test
    script: ["cargo clippy"]
    allow_failure: true
  build:
    stage: build
    script: ["cargo build --release"]
  docs:
    stage: publish
    script: ["mdbook build"]
"#;

/// Jobs of a stage all finish before the next stage starts
#[tokio::test]
async fn test_stages_run_in_order() {
    let runner = MockRunner::new();
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(YAML);

    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(runner.ran(), vec!["lint", "unit", "build", "docs"]);
}

/// A failure in the test stage skips every later stage
#[tokio::test]
async fn test_failure_blocks_later_stages() {
    let runner = MockRunner::new().always_fail("unit");
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(YAML);

    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_job(&result, "unit", "failed");
    assert_job(&result, "lint", "success");
    assert_job(&result, "build", "skipped");
    assert_job(&result, "docs", "skipped");
    assert!(!runner.ran().contains(&"build".to_string()));
}

/// An allowed failure is reported but neither blocks nor fails the run
#[tokio::test]
async fn test_allow_failure_keeps_verdict() {
    let runner = MockRunner::new().always_fail("lint");
    let engine = engine(runner.clone());
    let events = record_events(&engine).await;
    let mut pipeline = pipeline(YAML);

    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_job(&result, "lint", "failed");
    assert!(!result.job("lint").unwrap().affects_verdict);
    assert_job(&result, "docs", "success");
    assert!(events.lock().unwrap().iter().any(|event| matches!(
        event,
        ExecutionEvent::JobFailed { job, allow_failure: true, .. } if job == "lint"
    )));
}

/// Jobs of one stage overlap under the parallel strategy
#[tokio::test]
async fn test_parallel_jobs_in_stage_overlap() {
    let runner = MockRunner::new()
        .delay("unit", Duration::from_millis(300))
        .delay("lint", Duration::from_millis(300));
    let engine = ExecutionEngine::new(runner.clone(), SchedulingStrategy::Parallel);
    let mut pipeline = pipeline(YAML);

    let started = std::time::Instant::now();
    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert!(started.elapsed() < Duration::from_millis(550));
    assert_eq!(runner.ran().len(), 4);
}

/// Stage and job events arrive in stage order
#[tokio::test]
async fn test_stage_events() {
    let engine = engine(MockRunner::new());
    let events = record_events(&engine).await;
    let mut pipeline = pipeline(YAML);

    engine.execute(&mut pipeline, &push_to_main()).await;

    let stages: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            ExecutionEvent::StageStarted { stage, .. } => Some(stage.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(stages, vec!["test", "build", "publish"]);

    let events = events.lock().unwrap();
    assert!(matches!(events.first(), Some(ExecutionEvent::PipelineStarted { total_jobs: 4, .. })));
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::PipelineCompleted {
            status: ExecutionStatus::Success,
            awaiting_approval: 0,
            ..
        })
    ));
}
