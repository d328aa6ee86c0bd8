//! Run commands: `init-db`, `submit`, `execute`, `resume`, `status`, `runs`, `cancel`.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use console::style;
use runway::config::RunwayConfig;
use runway::errors::is_cancellation;
use runway::events::JsonLinesWriter;
use runway::orchestrator::{RunLauncher, RunOrchestrator, RunOutcome};
use runway::store::{ApprovalStore, NewRun, RunStore};
use runway_common::{ApprovalStatus, RunKind, RunStatus, StepStatus};

pub fn cmd_init_db(config: &RunwayConfig) -> Result<()> {
    super::open_store(config)?;
    println!("Database initialized at {}", config.database.path.display());
    Ok(())
}

pub async fn cmd_submit(
    config: &RunwayConfig,
    kind: RunKind,
    project: &str,
    intent: &str,
    execute: bool,
) -> Result<()> {
    let project = project.trim();
    if project.is_empty() {
        bail!("--project must not be empty");
    }
    if config.projects.get(project).is_none() {
        tracing::warn!(project_id = %project, "project is not configured under [projects]");
    }

    let store = super::open_store(config)?;
    let run = store
        .create_run(NewRun {
            kind,
            project_id: project.to_string(),
            intent: intent.to_string(),
        })
        .await?;
    println!("{}", serde_json::to_string(&run)?);

    if execute {
        let orchestrator = super::orchestrator(config, Arc::new(JsonLinesWriter::new()))?;
        drive(&orchestrator, &run.id).await?;
    }
    Ok(())
}

pub async fn cmd_execute(config: &RunwayConfig, run_id: &str) -> Result<()> {
    let orchestrator = super::orchestrator(config, Arc::new(JsonLinesWriter::new()))?;
    orchestrator.store().get_run_info(run_id).await?;
    drive(&orchestrator, run_id).await
}

/// Execute a run in the foreground; anything but success is an error.
async fn drive(orchestrator: &RunOrchestrator, run_id: &str) -> Result<()> {
    match orchestrator.execute_run(run_id).await {
        Ok(RunOutcome::Completed) | Ok(RunOutcome::AlreadyFinished(RunStatus::Succeeded)) => Ok(()),
        Ok(RunOutcome::AlreadyFinished(status)) => {
            bail!("Run {} already finished as {}", run_id, status)
        }
        Err(e) if is_cancellation(&e) => Err(e),
        Err(e) => Err(e.context(format!("Run {} failed", run_id))),
    }
}

pub async fn cmd_resume(config: &RunwayConfig) -> Result<()> {
    let orchestrator = super::orchestrator(config, Arc::new(JsonLinesWriter::new()))?;
    let launcher = RunLauncher::new(orchestrator);
    let started = launcher.resume_unfinished().await?;
    launcher.join_all().await;
    println!("Resumed {} run(s)", started);
    Ok(())
}

pub async fn cmd_status(config: &RunwayConfig, run_id: &str) -> Result<()> {
    let store = super::open_store(config)?;
    let run = store.get_run_info(run_id).await?;
    let steps = store.list_run_steps(run_id).await?;
    let approvals = store.list_approvals(Some(run_id), false).await?;

    println!(
        "{} {} ({}, project {})",
        style("Run").bold(),
        style(&run.id).cyan(),
        run.kind,
        run.project_id
    );
    println!("  status:      {}", styled_status(run.status.as_str()));
    if let Some(active) = &run.active_step_id {
        println!("  active step: {}", active);
    }
    if !run.intent.is_empty() {
        println!("  intent:      {}", run.intent);
    }
    if run.cancel_requested_at.is_some() {
        println!("  {}", style("cancel requested").yellow());
    }

    if !steps.is_empty() {
        println!();
        println!("{}", style("Steps").bold());
        for step in &steps {
            println!(
                "  {:<24} {:<14} {:<10} attempts {}",
                step.step_id,
                step.step_kind.as_str(),
                styled_status(step.status.as_str()),
                step.attempts
            );
            if step.status == StepStatus::Failed {
                if let Some(error) = &step.error {
                    println!("      {}", style(&error.message).red());
                }
            }
        }
    }

    if !approvals.is_empty() {
        println!();
        println!("{}", style("Approvals").bold());
        for approval in &approvals {
            let decided = match (&approval.approved_by, approval.status) {
                (_, ApprovalStatus::Pending) => String::new(),
                (Some(by), _) => format!(" by {}", by),
                (None, _) => String::new(),
            };
            println!(
                "  {} {:<12} {}{}  {}",
                approval.approval_id,
                approval.scope,
                styled_status(approval.status.as_str()),
                decided,
                style(&approval.intent_summary).dim()
            );
        }
    }
    Ok(())
}

pub async fn cmd_runs(config: &RunwayConfig, limit: usize) -> Result<()> {
    let store = super::open_store(config)?;
    let runs = store.list_runs(limit).await?;
    if runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<14} {:<10} {:<16} {}",
            run.id,
            run.kind.as_str(),
            styled_status(run.status.as_str()),
            run.project_id,
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub async fn cmd_cancel(config: &RunwayConfig, run_id: &str) -> Result<()> {
    let orchestrator = super::orchestrator(config, Arc::new(JsonLinesWriter::new()))?;
    let launcher = RunLauncher::new(orchestrator.clone());
    launcher.cancel(run_id).await?;
    launcher.join_all().await;

    let run = orchestrator
        .store()
        .get_run_info(run_id)
        .await
        .context("Failed to reload run")?;
    println!("Cancel requested for run {} (status {})", run.id, run.status);
    Ok(())
}

fn styled_status(status: &str) -> console::StyledObject<&str> {
    match status {
        "succeeded" | "approved" => style(status).green(),
        "failed" | "rejected" => style(status).red(),
        "canceled" => style(status).yellow(),
        "waiting" | "pending" => style(status).cyan(),
        _ => style(status),
    }
}
