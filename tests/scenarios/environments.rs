//! Test: Deployment environments and idempotent redeploys

use crate::helpers::*;
use stagehand::core::{EnvironmentRegistry, ExecutionStatus, PipelineContext, DEPLOY_TAG};
use stagehand::execution::{ExecutionEngine, ExecutionEvent, SchedulingStrategy};
use std::sync::Arc;

const YAML: &str = r#"
name: "Rollout"
jobs:
  deploy-ue1:
    stage: kubernetes
    script: ["helm upgrade node --set image.tag=$DEPLOY_TAG"]
    environment: parity-prod-ue1
    only:
      variables: ["$DEPLOY_TAG"]
  deploy-ew1:
    stage: kubernetes
    script: ["helm upgrade node --set image.tag=$DEPLOY_TAG"]
    environment:
      name: parity-prod-ew1
    only:
      variables: ["$DEPLOY_TAG"]
"#;

fn deploy(tag: &str) -> PipelineContext {
    PipelineContext::for_web("master", "4f2a9c1").with_variable(DEPLOY_TAG, tag)
}

fn shared_engine(
    runner: MockRunner,
    environments: &Arc<EnvironmentRegistry>,
) -> ExecutionEngine<MockRunner> {
    ExecutionEngine::new(runner, SchedulingStrategy::Sequential)
        .with_environments(Arc::clone(environments))
}

/// A deploy records the version on its environment
#[tokio::test]
async fn test_deploy_records_version() {
    let runner = MockRunner::new();
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(YAML);

    let result = engine.execute(&mut pipeline, &deploy("v2.0.1")).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    let environments = engine.environments();
    let ue1 = environments.get("parity-prod-ue1").await.unwrap();
    assert_eq!(ue1.job, "deploy-ue1");
    assert_eq!(ue1.deployed_version.as_deref(), Some("v2.0.1"));
    assert_eq!(environments.list().await.len(), 2);

    let call = runner.last_call("deploy-ew1").unwrap();
    assert_eq!(
        call.variables.get("CI_ENVIRONMENT_NAME").map(String::as_str),
        Some("parity-prod-ew1")
    );
}

/// Deploying the version an environment already runs does nothing
#[tokio::test]
async fn test_same_version_is_not_redeployed() {
    let environments = Arc::new(EnvironmentRegistry::new());

    let first = MockRunner::new();
    let engine = shared_engine(first.clone(), &environments);
    let mut pipeline_one = pipeline(YAML);
    engine.execute(&mut pipeline_one, &deploy("v2.0.1")).await;
    assert_eq!(first.attempts("deploy-ue1"), 1);

    let second = MockRunner::new();
    let engine = shared_engine(second.clone(), &environments);
    let events = record_events(&engine).await;
    let mut pipeline_two = pipeline(YAML);
    let result = engine.execute(&mut pipeline_two, &deploy("v2.0.1")).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_job(&result, "deploy-ue1", "success");
    assert_eq!(result.job("deploy-ue1").unwrap().attempts, 0);
    assert!(second.calls().is_empty());
    assert!(events.lock().unwrap().iter().any(|event| matches!(
        event,
        ExecutionEvent::DeploymentRecorded { unchanged: true, environment, .. }
            if environment == "parity-prod-ue1"
    )));
}

/// A new version rolls out again
#[tokio::test]
async fn test_new_version_redeploys() {
    let environments = Arc::new(EnvironmentRegistry::new());

    let engine = shared_engine(MockRunner::new(), &environments);
    let mut pipeline_one = pipeline(YAML);
    engine.execute(&mut pipeline_one, &deploy("v2.0.1")).await;

    let runner = MockRunner::new();
    let engine = shared_engine(runner.clone(), &environments);
    let mut pipeline_two = pipeline(YAML);
    engine.execute(&mut pipeline_two, &deploy("v2.0.2")).await;

    assert_eq!(runner.ran(), vec!["deploy-ew1", "deploy-ue1"]);
    let ue1 = environments.get("parity-prod-ue1").await.unwrap();
    assert_eq!(ue1.deployed_version.as_deref(), Some("v2.0.2"));
}

/// A failed deploy leaves the recorded version alone
#[tokio::test]
async fn test_failed_deploy_keeps_version() {
    let environments = Arc::new(EnvironmentRegistry::new());

    let engine = shared_engine(MockRunner::new(), &environments);
    let mut pipeline_one = pipeline(YAML);
    engine.execute(&mut pipeline_one, &deploy("v2.0.1")).await;

    let engine = shared_engine(MockRunner::new().always_fail("deploy-ue1"), &environments);
    let mut pipeline_two = pipeline(YAML);
    let result = engine.execute(&mut pipeline_two, &deploy("v2.0.2")).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    let ue1 = environments.get("parity-prod-ue1").await.unwrap();
    assert_eq!(ue1.deployed_version.as_deref(), Some("v2.0.1"));
}
