use anyhow::{Context, Result};
use stagehand::cli::commands::{
    HistoryCommand, ListCommand, PlanCommand, RunCommand, ValidateCommand,
};
use stagehand::cli::output::*;
use stagehand::cli::{Cli, Command};
use stagehand::core::config::PipelineConfig;
use stagehand::core::ExecutionStatus;
use stagehand::execution::{ExecutionEngine, StageScheduler};
use stagehand::persistence::{create_summary, InMemoryPersistence, PersistenceBackend, RunSummary};
use stagehand::runner::{ShellRunner, ShellRunnerConfig};
use std::sync::Arc;
use tracing::{debug, error, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Logs go to stderr so --json output stays parseable
    let log_level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Plan(cmd) => plan_pipeline(cmd)?,
        Command::List(cmd) => list_pipelines(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

async fn open_history() -> Result<Arc<dyn PersistenceBackend>> {
    #[cfg(feature = "sqlite")]
    let store: Arc<dyn PersistenceBackend> =
        Arc::new(stagehand::persistence::SqliteExecutionStore::with_default_path().await?);

    #[cfg(not(feature = "sqlite"))]
    let store: Arc<dyn PersistenceBackend> = {
        warn!("Built without sqlite; history is not kept");
        Arc::new(InMemoryPersistence::new())
    };

    Ok(store)
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let config = PipelineConfig::from_file(&cmd.file).context("Failed to load pipeline config")?;
    let mut pipeline = config.to_pipeline()?;
    let ctx = cmd.context.to_context();

    if !cmd.json {
        println!(
            "{} Loaded pipeline: {} ({} @ {})",
            INFO,
            style(&pipeline.name).bold(),
            style(ctx.ref_name()).cyan(),
            style(ctx.commit_sha()).dim()
        );
    }

    let store: Arc<dyn PersistenceBackend> = if cmd.no_history {
        Arc::new(InMemoryPersistence::new())
    } else {
        open_history().await?
    };

    let mut runner_config = ShellRunnerConfig::new();
    if let Some(workspace) = &cmd.workspace {
        runner_config = runner_config.with_workspace_root(workspace);
    }
    let engine = ExecutionEngine::new(ShellRunner::new(runner_config), cmd.strategy());

    let progress = (!cmd.json).then(|| create_progress_bar(pipeline.jobs.len()));
    if let Some(progress) = progress.clone() {
        engine
            .add_event_handler(move |event| {
                progress.println(format_execution_event(&event));
                if finishes_job(&event) {
                    progress.inc(1);
                }
            })
            .await;
    }

    // Decisions given up front apply as soon as each gate is reached
    let control = engine.control();
    for job in &cmd.approve {
        control.approve(job.as_str());
    }
    for job in &cmd.reject {
        control.reject(job.as_str());
    }

    let cancel = engine.control();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling pipeline");
            cancel.cancel();
        }
    });

    let result = engine.execute(&mut pipeline, &ctx).await;
    interrupt.abort();
    if let Some(progress) = &progress {
        progress.finish_and_clear();
    }

    if !cmd.no_history {
        let summary = create_summary(&pipeline, &result, &ctx);
        store.save_run(&summary).await?;
    }

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("\n{}", format_result(&result));
        if !result.awaiting_approval.is_empty() {
            println!(
                "\n{} Waiting for approval: {} (rerun with --approve <job>)",
                HAND,
                result.awaiting_approval.join(", ")
            );
        }
    }

    // This process owns the run; nothing resumes it after exit
    let purged = engine.artifact_store().purge_run(ctx.run_id()).await;
    debug!("Dropped {} artifacts of run {}", purged, ctx.run_id());

    match result.status {
        ExecutionStatus::Success => Ok(()),
        status => {
            error!("Pipeline {} finished with status {}", pipeline.name, status);
            std::process::exit(1);
        }
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    match PipelineConfig::from_file(&cmd.file).and_then(|config| {
        let pipeline = config.to_pipeline()?;
        Ok((config, pipeline))
    }) {
        Ok((config, pipeline)) => {
            if cmd.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
                return Ok(());
            }
            println!("{} Pipeline configuration is valid!", CHECK);
            println!("  Name: {}", style(&pipeline.name).bold());
            println!("  Stages: {}", style(pipeline.stages.len()).cyan());
            println!("  Jobs: {}", style(pipeline.jobs.len()).cyan());
            println!("  Variables: {}", style(pipeline.variables.len()).cyan());
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

fn plan_pipeline(cmd: &PlanCommand) -> Result<()> {
    let config = PipelineConfig::from_file(&cmd.file).context("Failed to load pipeline config")?;
    let pipeline = config.to_pipeline()?;
    let ctx = cmd.context.to_context();

    let plan = StageScheduler::default().plan(&pipeline, &ctx);
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!("{}", format_plan(&plan));
        println!(
            "\n{} {} of {} jobs would run",
            INFO,
            style(plan.runnable()).cyan(),
            pipeline.jobs.len()
        );
    }
    Ok(())
}

async fn list_pipelines(cmd: &ListCommand) -> Result<()> {
    let store = open_history().await?;
    let pipelines = store.list_pipelines().await?;

    if cmd.json {
        let mut json_data = Vec::new();
        for pipeline in &pipelines {
            let runs = store.list_runs(pipeline).await?;
            json_data.push(serde_json::json!({
                "name": pipeline,
                "run_count": runs.len(),
            }));
        }
        let data = serde_json::json!({ "pipelines": json_data });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if pipelines.is_empty() {
        println!("{} No pipelines found in history", INFO);
        return Ok(());
    }

    println!("{} Pipelines in history:", INFO);
    for pipeline_name in &pipelines {
        if cmd.with_counts {
            let runs = store.list_runs(pipeline_name).await?;
            let succeeded = runs.iter().filter(|r| r.status == ExecutionStatus::Success).count();
            let failed = runs.iter().filter(|r| r.status == ExecutionStatus::Failed).count();
            println!(
                "  {} ({} runs: {} succeeded, {} failed)",
                style(pipeline_name).bold(),
                style(runs.len()).cyan(),
                style(succeeded).green(),
                style(failed).red()
            );
        } else {
            println!("  {}", style(pipeline_name).bold());
        }
    }

    Ok(())
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_history().await?;

    if let Some(run_id) = &cmd.run_id {
        let run_id = uuid::Uuid::parse_str(run_id).context("Invalid run ID format")?;
        match store.load_run(run_id).await? {
            Some(summary) if cmd.json => println!("{}", serde_json::to_string_pretty(&summary)?),
            Some(summary) => print_run_details(&summary),
            None => println!("{} Run not found", WARN),
        }
        return Ok(());
    }

    let mut runs = match &cmd.pipeline {
        Some(pipeline_name) => store.list_runs(pipeline_name).await?,
        None => {
            let mut all_runs = Vec::new();
            for pipeline in store.list_pipelines().await? {
                all_runs.extend(store.list_runs(&pipeline).await?);
            }
            all_runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            all_runs
        }
    };
    runs.truncate(cmd.limit);

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    println!("{} Run history (latest {}):", INFO, runs.len());
    for summary in &runs {
        println!("  {}", format_run_summary(summary));
    }

    Ok(())
}

fn print_run_details(summary: &RunSummary) {
    println!("{} Run Details", INFO);
    println!("  ID: {}", style(summary.run_id).cyan());
    println!("  Pipeline: {}", style(&summary.pipeline_name).bold());
    println!("  Ref: {}", style(&summary.ref_name).cyan());
    println!("  Status: {}", format_status(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(completed) = summary.completed_at {
        println!("  Finished: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Jobs: {} total, {} succeeded, {} failed, {} skipped, {} awaiting approval",
        summary.total_jobs,
        style(summary.succeeded).green(),
        style(summary.failed).red(),
        summary.skipped,
        summary.awaiting_approval
    );
}

fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
