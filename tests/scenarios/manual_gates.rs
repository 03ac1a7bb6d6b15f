//! Test: Manual gates, approvals, rejection and cancellation

use crate::helpers::*;
use stagehand::core::ExecutionStatus;
use stagehand::execution::{ExecutionEngine, ExecutionEvent, SchedulingStrategy};
use stagehand::ArtifactStore;
use std::time::Duration;

const YAML: &str = r#"
name: "Deploy"
jobs:
  build:
    stage: build
    script: ["make"]
  deploy-staging:
    stage: publish
    when: manual
    script: ["helm upgrade staging"]
    dependencies: [build]
  smoke:
    stage: kubernetes
    script: ["./smoke.sh"]
    dependencies: [deploy-staging]
  notify:
    stage: kubernetes
    script: ["./notify.sh"]
"#;

/// A manual job waits; independent later jobs go ahead
#[tokio::test]
async fn test_manual_job_waits_for_approval() {
    let runner = MockRunner::new();
    let engine = engine(runner.clone());
    let events = record_events(&engine).await;
    let mut pipeline = pipeline(YAML);

    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.awaiting_approval, vec!["deploy-staging".to_string()]);
    assert_job(&result, "deploy-staging", "manual");
    assert_job(&result, "smoke", "pending");
    assert_job(&result, "notify", "success");
    assert_eq!(runner.ran(), vec!["build", "notify"]);
    assert!(!pipeline.is_complete());
    assert_eq!(pipeline.state.progress(), 0.5);
    assert!(events.lock().unwrap().iter().any(|event| matches!(
        event,
        ExecutionEvent::JobAwaitingApproval { job } if job == "deploy-staging"
    )));
}

/// Approving resumes the same run where it stopped
#[tokio::test]
async fn test_approval_resumes_run() {
    let runner = MockRunner::new();
    let engine = engine(runner.clone());
    let events = record_events(&engine).await;
    let mut pipeline = pipeline(YAML);
    let ctx = push_to_main();

    engine.execute(&mut pipeline, &ctx).await;
    engine.control().approve("deploy-staging");
    let result = engine.execute(&mut pipeline, &ctx).await;

    assert!(result.is_success());
    assert!(pipeline.is_complete());
    assert!(result.awaiting_approval.is_empty());
    assert_job(&result, "deploy-staging", "success");
    assert_job(&result, "smoke", "success");
    assert_eq!(runner.ran(), vec!["build", "notify", "deploy-staging", "smoke"]);
    assert_eq!(runner.attempts("build"), 1);

    let events = events.lock().unwrap();
    assert!(events
        .iter()
        .any(|event| matches!(event, ExecutionEvent::PipelineResumed { .. })));
    assert!(events.iter().any(|event| matches!(
        event,
        ExecutionEvent::JobApproved { job } if job == "deploy-staging"
    )));
}

/// An approval given before the gate is reached applies when it is
#[tokio::test]
async fn test_early_approval() {
    let runner = MockRunner::new();
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(YAML);

    engine.control().approve("deploy-staging");
    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert!(result.awaiting_approval.is_empty());
    assert_job(&result, "smoke", "success");
}

/// Rejection fails the job and blocks what depends on it
#[tokio::test]
async fn test_rejection_fails_run() {
    let runner = MockRunner::new();
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(YAML);
    let ctx = push_to_main();

    engine.execute(&mut pipeline, &ctx).await;
    engine.control().reject("deploy-staging");
    let result = engine.execute(&mut pipeline, &ctx).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_job(&result, "deploy-staging", "failed");
    assert_job(&result, "smoke", "skipped");
    assert_eq!(runner.attempts("deploy-staging"), 0);
}

/// A rejected gate with allow_failure keeps the verdict but still blocks
#[tokio::test]
async fn test_rejection_with_allow_failure() {
    let yaml = YAML.replace(
        "    when: manual\n",
        "    when: manual\n    allow_failure: true\n",
    );
    let runner = MockRunner::new();
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(&yaml);
    let ctx = push_to_main();

    engine.execute(&mut pipeline, &ctx).await;
    engine.control().reject("deploy-staging");
    let result = engine.execute(&mut pipeline, &ctx).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_job(&result, "deploy-staging", "failed");
    assert_job(&result, "smoke", "skipped");
}

/// Approving a job that is not manual changes nothing
#[tokio::test]
async fn test_approving_automatic_job_is_ignored() {
    let runner = MockRunner::new().always_fail("build");
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(YAML);

    engine.control().approve("build");
    engine.control().approve("no-such-job");
    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(runner.attempts("build"), 1);
}

/// The blocking policy holds later stages behind a pending gate
#[tokio::test]
async fn test_block_policy_holds_later_stages() {
    let yaml = format!("manual_gate_policy: block\n{}", YAML);
    let runner = MockRunner::new();
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(&yaml);
    let ctx = push_to_main();

    let result = engine.execute(&mut pipeline, &ctx).await;

    assert_eq!(result.awaiting_approval, vec!["deploy-staging".to_string()]);
    assert_job(&result, "notify", "pending");
    assert_eq!(runner.ran(), vec!["build"]);

    engine.control().approve("deploy-staging");
    let result = engine.execute(&mut pipeline, &ctx).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(runner.ran(), vec!["build", "deploy-staging", "notify", "smoke"]);
}

/// Cancelling stops running jobs and cancels everything unfinished
#[tokio::test]
async fn test_cancel_running_pipeline() {
    let runner = MockRunner::new().delay("build", Duration::from_secs(30));
    let engine = std::sync::Arc::new(ExecutionEngine::new(
        runner.clone(),
        SchedulingStrategy::Parallel,
    ));
    let mut pipeline = pipeline(YAML);

    let control = engine.control();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        control.cancel();
    });

    let started = std::time::Instant::now();
    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert_job(&result, "build", "cancelled");
    assert_job(&result, "notify", "cancelled");
    assert_eq!(result.count("cancelled"), 4);

    // A cancelled run cannot be resumed
    engine.control().approve("deploy-staging");
    let again = engine.execute(&mut pipeline, &push_to_main()).await;
    assert_eq!(again.status, ExecutionStatus::Cancelled);
    assert_eq!(runner.attempts("smoke"), 0);
}

/// Artifacts published before a cancel stay available until they expire
#[tokio::test]
async fn test_cancel_keeps_published_artifacts() {
    let yaml = r#"
name: "Cancelled release"
jobs:
  unit:
    stage: test
    script: ["cargo test"]
    artifacts:
      paths: ["reports/"]
      expire_in: "1 day"
  build:
    stage: build
    script: ["cargo build --release"]
    dependencies: [unit]
"#;
    let runner = MockRunner::new()
        .produce("unit", "reports/junit.xml", "<testsuite/>")
        .delay("build", Duration::from_secs(30));
    let engine = ExecutionEngine::new(runner.clone(), SchedulingStrategy::Parallel);
    let mut pipeline = pipeline(yaml);
    let ctx = push_to_main();

    let control = engine.control();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        control.cancel();
    });

    let result = engine.execute(&mut pipeline, &ctx).await;

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert_job(&result, "unit", "success");
    assert_job(&result, "build", "cancelled");
    assert!(result.artifacts.contains_key("unit"));

    let stored = engine
        .artifact_store()
        .get("unit", ctx.run_id())
        .await
        .expect("artifact survives the cancel");
    assert_eq!(
        stored.files.get("reports/junit.xml"),
        Some(&b"<testsuite/>".to_vec())
    );
}
