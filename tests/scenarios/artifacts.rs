//! Test: Artifact hand-off between stages

use crate::helpers::*;
use stagehand::core::{ExecutionStatus, SkipReason};
use stagehand::execution::ExecutionEvent;
use stagehand::ArtifactStore;
use std::time::Duration;

const YAML: &str = r#"
name: "Release"
jobs:
  test:
    stage: test
    script: ["cargo test"]
  build:
    stage: build
    script: ["cargo build --release", "cp target/release/node artifacts/"]
    dependencies: [test]
    artifacts:
      name: "node-$CI_COMMIT_SHA"
      paths: ["artifacts/"]
      expire_in: "1 week"
  publish:
    stage: publish
    script: ["docker build -t node artifacts/"]
    dependencies: [build]
"#;

/// publish receives exactly the files build produced
#[tokio::test]
async fn test_artifact_passes_from_build_to_publish() {
    let runner = MockRunner::new()
        .produce("build", "artifacts/node", "ELF binary")
        .produce("build", "artifacts/node.sha256", "deadbeef")
        .produce("build", "target/cache", "not declared");
    let engine = engine(runner.clone());
    let events = record_events(&engine).await;
    let mut pipeline = pipeline(YAML);
    let ctx = push_to_main();

    let result = engine.execute(&mut pipeline, &ctx).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    let published = result.artifacts.get("build").expect("build artifact");
    assert_eq!(published.name, "node-4f2a9c1");
    assert_eq!(published.files.len(), 2);
    assert_eq!(published.files["artifacts/node"], b"ELF binary".to_vec());
    assert!(published.expires_at.is_some());

    let inputs = runner.last_call("publish").unwrap().inputs;
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs["build"].files, published.files);

    let stored = engine.artifact_store().get("build", ctx.run_id()).await.unwrap();
    assert_eq!(stored.files, published.files);
    assert!(events.lock().unwrap().iter().any(|event| matches!(
        event,
        ExecutionEvent::ArtifactPublished { job, files: 2, .. } if job == "build"
    )));
}

/// A failed build publishes nothing and publish never starts
#[tokio::test]
async fn test_failed_build_blocks_publish() {
    let runner = MockRunner::new()
        .produce("build", "artifacts/node", "partial")
        .always_fail("build");
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(YAML);

    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_job(&result, "build", "failed");
    assert_job(&result, "publish", "skipped");
    assert!(result.artifacts.is_empty());
    assert_eq!(runner.attempts("publish"), 0);
}

/// An artifact that expires before its consumer starts skips the consumer
#[tokio::test]
async fn test_expired_artifact_skips_consumer() {
    let yaml = r#"
name: "Short retention"
jobs:
  build:
    stage: build
    script: ["make"]
    artifacts:
      paths: ["out/"]
      expire_in: "1 sec"
  slow-check:
    stage: build
    script: ["sleep 2"]
  publish:
    stage: publish
    script: ["upload out/"]
    dependencies: [build]
"#;
    let runner = MockRunner::new()
        .produce("build", "out/app", "binary")
        .delay("slow-check", Duration::from_millis(1500));
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(yaml);

    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_job(&result, "publish", "skipped");
    assert_eq!(runner.attempts("publish"), 0);

    let report = result.job("publish").unwrap();
    assert_eq!(
        report.detail.as_deref(),
        Some(
            SkipReason::ArtifactUnavailable {
                dependency: "build".to_string(),
                expired: true
            }
            .to_string()
            .as_str()
        )
    );
}

/// Artifacts with `never` retention have no expiry
#[tokio::test]
async fn test_never_expiring_artifact() {
    let yaml = r#"
name: "Keep forever"
jobs:
  build:
    stage: build
    script: ["make"]
    artifacts:
      paths: ["out/"]
      expire_in: never
"#;
    let runner = MockRunner::new().produce("build", "out/app", "binary");
    let engine = engine(runner);
    let mut pipeline = pipeline(yaml);

    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    let artifact = result.artifacts.get("build").unwrap();
    assert!(artifact.expires_at.is_none());
    assert_eq!(artifact.name, "build");
}

/// Runs never see each other's artifacts
#[tokio::test]
async fn test_artifacts_are_scoped_to_run() {
    let runner = MockRunner::new().produce("build", "artifacts/node", "v1");
    let engine = engine(runner.clone());

    let first = push_to_main();
    let mut pipeline_one = pipeline(YAML);
    engine.execute(&mut pipeline_one, &first).await;

    let second = push_to_main();
    let store = engine.artifact_store();
    assert!(store.get("build", second.run_id()).await.is_err());
    assert_eq!(store.list_run(first.run_id()).await.len(), 1);
}

/// An allowed failure publishes nothing; its dependent runs without input
#[tokio::test]
async fn test_allowed_failure_with_artifacts_keeps_verdict() {
    let yaml = r#"
name: "Flaky artifacts"
jobs:
  flaky:
    stage: build
    script: ["./bench.sh"]
    allow_failure: true
    artifacts:
      paths: ["out/"]
  publish:
    stage: publish
    script: ["./publish.sh"]
    dependencies: [flaky]
"#;
    let runner = MockRunner::new().always_fail("flaky");
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(yaml);

    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_job(&result, "flaky", "failed");
    assert_job(&result, "publish", "success");
    assert!(runner
        .last_call("publish")
        .is_some_and(|call| call.inputs.is_empty()));
    assert!(result.artifacts.is_empty());
}
