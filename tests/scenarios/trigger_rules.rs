//! Test: only/except trigger rules and DEPLOY_TAG

use crate::helpers::*;
use stagehand::core::{ExecutionStatus, PipelineContext, DEPLOY_TAG};

const YAML: &str = r#"
name: "Node"
variables:
  CARGO_TERM_COLOR: always
jobs:
  test:
    stage: test
    script: ["cargo test"]
    except:
      variables: ["$DEPLOY_TAG"]
  build:
    stage: build
    script: ["cargo build --release"]
    dependencies: [test]
    except:
      variables: ["$DEPLOY_TAG"]
  publish:
    stage: publish
    script: ["docker push node:$CI_COMMIT_SHA"]
    dependencies: [build]
    only:
      - master
      - "/^v[0-9]+\\.[0-9]+.*$/"
      - web
  deploy:
    stage: kubernetes
    script: ["helm upgrade node --set tag=$DEPLOY_TAG"]
    only:
      variables: ["$DEPLOY_TAG"]
  nightly:
    stage: test
    script: ["cargo bench"]
    only: [schedules]
"#;

/// A branch push runs the regular jobs only
#[tokio::test]
async fn test_branch_push() {
    let runner = MockRunner::new();
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(YAML);

    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(runner.ran(), vec!["test", "build"]);
    assert_job(&result, "publish", "skipped");
    assert_job(&result, "deploy", "skipped");
    assert_job(&result, "nightly", "skipped");
}

/// Setting DEPLOY_TAG runs only the deploy job
#[tokio::test]
async fn test_deploy_tag_skips_build_jobs() {
    let runner = MockRunner::new();
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(YAML);
    let ctx = PipelineContext::for_web("master", "4f2a9c1").with_variable(DEPLOY_TAG, "v1.4.2");

    let result = engine.execute(&mut pipeline, &ctx).await;

    // Skipped by rule does not fail the run, even with dependents left out
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(runner.ran(), vec!["deploy"]);
    assert_job(&result, "test", "skipped");
    assert_job(&result, "build", "skipped");
    assert_job(&result, "publish", "skipped");

    let call = runner.last_call("deploy").unwrap();
    assert_eq!(call.variables.get(DEPLOY_TAG).map(String::as_str), Some("v1.4.2"));
}

/// A version tag reaches publish through the regex ref
#[tokio::test]
async fn test_tag_pipeline_publishes() {
    let runner = MockRunner::new();
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(YAML);
    let ctx = PipelineContext::for_tag("v1.4.2", "4f2a9c1");

    let result = engine.execute(&mut pipeline, &ctx).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(runner.ran(), vec!["test", "build", "publish"]);

    let call = runner.last_call("publish").unwrap();
    assert_eq!(call.variables.get("CI_COMMIT_SHA").map(String::as_str), Some("4f2a9c1"));
    assert_eq!(call.variables.get("CI_JOB_STAGE").map(String::as_str), Some("publish"));
    assert_eq!(call.variables.get("CARGO_TERM_COLOR").map(String::as_str), Some("always"));
}

/// Scheduled pipelines pick up schedule-only jobs
#[tokio::test]
async fn test_schedule_runs_nightly() {
    let runner = MockRunner::new();
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(YAML);
    let ctx = PipelineContext::for_schedule("master", "4f2a9c1");

    let result = engine.execute(&mut pipeline, &ctx).await;

    assert_job(&result, "nightly", "success");
    assert_job(&result, "publish", "success");
}

/// A malformed rule skips its job instead of running it
#[tokio::test]
async fn test_invalid_rule_skips_job() {
    let yaml = r#"
name: "Broken rule"
jobs:
  test:
    stage: test
    script: ["cargo test"]
    only: ["/unterminated"]
  lint:
    stage: test
    script: ["cargo fmt --check"]
"#;
    let runner = MockRunner::new();
    let engine = engine(runner.clone());
    let mut pipeline = pipeline(yaml);

    let result = engine.execute(&mut pipeline, &push_to_main()).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_job(&result, "test", "skipped");
    assert_eq!(runner.ran(), vec!["lint"]);
}
