//! Test: Retry counts and attempt bookkeeping

use crate::helpers::*;
use stagehand::core::ExecutionStatus;
use stagehand::execution::ExecutionEvent;

fn yaml(retry: usize) -> String {
    format!(
        r#"
name: "Flaky"
jobs:
  integration:
    stage: test
    retry: {}
    script: ["./run-integration.sh"]
  package:
    stage: build
    script: ["tar czf dist.tgz target"]
"#,
        retry
    )
}

/// One failure followed by success passes with one retry
#[tokio::test]
async fn test_fail_then_succeed_with_one_retry() {
    let runner = MockRunner::new().exit_codes("integration", vec![1, 0]);
    let engine = engine(runner.clone());
    let events = record_events(&engine).await;
    let mut pipeline = pipeline(&yaml(1));

    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_job(&result, "integration", "success");
    assert_eq!(result.job("integration").unwrap().attempts, 2);
    assert_eq!(runner.attempts("integration"), 2);

    let retries = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, ExecutionEvent::JobRetrying { attempt: 2, max_attempts: 2, .. }))
        .count();
    assert_eq!(retries, 1);
}

/// retry: 1 allows exactly two attempts
#[tokio::test]
async fn test_two_failures_exhaust_one_retry() {
    let runner = MockRunner::new().exit_codes("integration", vec![1, 1, 0]);
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(&yaml(1));

    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_job(&result, "integration", "failed");
    assert_eq!(result.job("integration").unwrap().attempts, 2);
    assert_eq!(runner.attempts("integration"), 2);
    assert_job(&result, "package", "skipped");
}

/// Without retries a single failure is final
#[tokio::test]
async fn test_no_retry_by_default() {
    let runner = MockRunner::new().exit_codes("integration", vec![1, 0]);
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(&yaml(0));

    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(runner.attempts("integration"), 1);
}

/// Every attempt sees its own attempt number
#[tokio::test]
async fn test_attempt_numbers() {
    let runner = MockRunner::new().exit_codes("integration", vec![1, 1, 0]);
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(&yaml(2));

    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    let attempts: Vec<usize> = runner
        .calls()
        .iter()
        .filter(|call| call.job == "integration")
        .map(|call| call.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

/// Pipeline-wide retry default applies to jobs without their own
#[tokio::test]
async fn test_default_retry() {
    let yaml = r#"
name: "Defaults"
defaults:
  retry: 2
jobs:
  integration:
    stage: test
    script: ["./run-integration.sh"]
"#;
    let runner = MockRunner::new().always_fail("integration");
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(yaml);

    engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(runner.attempts("integration"), 3);
}
