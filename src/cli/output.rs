//! CLI output formatting

use crate::{
    core::{ExecutionStatus, PipelineResult},
    execution::{Disposition, ExecutionEvent, ExecutionPlan},
    persistence::RunSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static HAND: Emoji<'_, '_> = Emoji("✋ ", "? ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "* ");

/// Create a progress bar over the jobs of a run
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress template is valid")
            .progress_chars("#>-"),
    );
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Whether an event moves a job to a final state
pub fn finishes_job(event: &ExecutionEvent) -> bool {
    matches!(
        event,
        ExecutionEvent::JobSucceeded { .. }
            | ExecutionEvent::JobFailed { .. }
            | ExecutionEvent::JobSkipped { .. }
            | ExecutionEvent::JobCancelled { .. }
    )
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Success => style("SUCCESS").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format a job state label for display
pub fn format_job_status(label: &str, allow_failure: bool) -> String {
    let upper = label.to_uppercase();
    match label {
        "success" => style(upper).green().to_string(),
        "failed" if allow_failure => style(format!("{} (allowed)", upper)).yellow().to_string(),
        "failed" => style(upper).red().to_string(),
        "running" | "manual" | "approved" => style(upper).yellow().to_string(),
        "cancelled" => style(upper).yellow().to_string(),
        _ => style(upper).dim().to_string(),
    }
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format run summary for display
pub fn format_run_summary(summary: &RunSummary) -> String {
    let status_icon = match summary.status {
        ExecutionStatus::Success if summary.awaiting_approval > 0 => HAND,
        ExecutionStatus::Success => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running => SPINNER,
        _ => INFO,
    };

    format!(
        "{} {} - {} @ {} - {} ({} ok, {} failed, {} skipped, {} waiting) - {}",
        status_icon,
        style(short_id(&summary.run_id)).dim(),
        style(&summary.pipeline_name).bold(),
        style(&summary.ref_name).cyan(),
        format_status(summary.status),
        summary.succeeded,
        summary.failed,
        summary.skipped,
        summary.awaiting_approval,
        style(summary.started_at.format("%Y-%m-%d %H:%M:%S")).dim()
    )
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineStarted {
            run_id,
            pipeline_name,
            total_jobs,
        } => format!(
            "{} Starting pipeline {} ({}, {} jobs)",
            ROCKET,
            style(pipeline_name).bold(),
            style(short_id(run_id)).dim(),
            total_jobs
        ),
        ExecutionEvent::PipelineResumed {
            run_id,
            pipeline_name,
        } => format!(
            "{} Resuming pipeline {} ({})",
            ROCKET,
            style(pipeline_name).bold(),
            style(short_id(run_id)).dim()
        ),
        ExecutionEvent::StageStarted { stage, index } => format!(
            "{} Stage {} {}",
            INFO,
            style(index + 1).dim(),
            style(stage).bold().underlined()
        ),
        ExecutionEvent::JobStarted { job, attempt } => {
            if *attempt > 1 {
                format!("{} {} (attempt {})", SPINNER, style(job).cyan(), attempt)
            } else {
                format!("{} {}", SPINNER, style(job).cyan())
            }
        }
        ExecutionEvent::JobRetrying {
            job,
            attempt,
            max_attempts,
        } => format!(
            "{} {} retrying (attempt {}/{})",
            WARN,
            style(job).yellow(),
            attempt,
            max_attempts
        ),
        ExecutionEvent::JobOutput { job, log } => {
            format!("{} Output from {}:\n{}", INFO, style(job).dim(), format_output(log, 5))
        }
        ExecutionEvent::JobSucceeded { job, attempts } => {
            if *attempts == 0 {
                format!("{} {} (nothing to do)", CHECK, style(job).green())
            } else {
                format!("{} {}", CHECK, style(job).green())
            }
        }
        ExecutionEvent::JobFailed {
            job,
            error,
            allow_failure,
            ..
        } => {
            if *allow_failure {
                format!(
                    "{} {} failed (allowed): {}",
                    WARN,
                    style(job).yellow(),
                    style(error).dim()
                )
            } else {
                format!("{} {}: {}", CROSS, style(job).red(), style(error).dim())
            }
        }
        ExecutionEvent::JobSkipped { job, reason } => {
            format!("{} {} skipped ({})", SKIP, style(job).dim(), reason)
        }
        ExecutionEvent::JobAwaitingApproval { job } => format!(
            "{} {} is waiting for manual approval",
            HAND,
            style(job).yellow().bold()
        ),
        ExecutionEvent::JobApproved { job } => {
            format!("{} {} approved", INFO, style(job).cyan())
        }
        ExecutionEvent::JobRejected { job } => {
            format!("{} {} rejected", CROSS, style(job).red())
        }
        ExecutionEvent::JobCancelled { job } => {
            format!("{} {} cancelled", WARN, style(job).dim())
        }
        ExecutionEvent::ArtifactPublished {
            job,
            name,
            files,
            expires_at,
        } => {
            let expiry = match expires_at {
                Some(at) => format!("expires {}", at.format("%Y-%m-%d %H:%M")),
                None => "never expires".to_string(),
            };
            format!(
                "{} {} published {} ({} files, {})",
                PACKAGE,
                style(job).cyan(),
                style(name).bold(),
                files,
                style(expiry).dim()
            )
        }
        ExecutionEvent::DeploymentRecorded {
            environment,
            version,
            unchanged,
            ..
        } => {
            if *unchanged {
                format!(
                    "{} {} already runs {}",
                    INFO,
                    style(environment).bold(),
                    style(version).cyan()
                )
            } else {
                format!(
                    "{} Deployed {} to {}",
                    ROCKET,
                    style(version).cyan(),
                    style(environment).bold()
                )
            }
        }
        ExecutionEvent::PipelineCompleted {
            run_id,
            status,
            awaiting_approval,
        } => {
            let mut line = format!(
                "{} Pipeline ({}) finished: {}",
                INFO,
                style(short_id(run_id)).dim(),
                format_status(*status)
            );
            if *awaiting_approval > 0 {
                line.push_str(&format!(", {} job(s) awaiting approval", awaiting_approval));
            }
            line
        }
    }
}

/// Per-job table of a result
pub fn format_result(result: &PipelineResult) -> String {
    let mut lines = vec![format!(
        "{} {} - {}",
        INFO,
        style(&result.pipeline).bold(),
        format_status(result.status)
    )];
    for report in result.jobs.values() {
        let mut line = format!(
            "  {:<24} {:<12} {}",
            report.name,
            style(&report.stage).dim(),
            format_job_status(&report.status, report.allow_failure)
        );
        if report.attempts > 1 {
            line.push_str(&format!(" after {} attempts", report.attempts));
        }
        if let Some(detail) = &report.detail {
            if report.status != "success" {
                line.push_str(&format!(" - {}", style(detail).dim()));
            }
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// Stage-by-stage view of a plan
pub fn format_plan(plan: &ExecutionPlan) -> String {
    let mut lines = vec![format!("{} Plan for {}", INFO, style(&plan.pipeline).bold())];
    for stage in plan.stages.iter().filter(|stage| !stage.jobs.is_empty()) {
        lines.push(format!("  {}", style(&stage.name).bold().underlined()));
        for job in &stage.jobs {
            let disposition = match &job.disposition {
                Disposition::Run => style("run".to_string()).green().to_string(),
                Disposition::Manual => style("manual".to_string()).yellow().to_string(),
                Disposition::Skip { reason } => style(format!("skip ({})", reason)).dim().to_string(),
                Disposition::Blocked { dependency } => {
                    style(format!("blocked by {}", dependency)).red().to_string()
                }
            };
            lines.push(format!(
                "    {:<24} {} {}",
                job.name,
                disposition,
                style(&job.rule).dim()
            ));
        }
    }
    lines.join("\n")
}

/// Format job output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.trim_end().to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}
