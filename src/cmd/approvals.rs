//! Approval commands: `approvals`, `approve`, `reject`.

use anyhow::{Result, bail};
use console::style;
use runway::config::RunwayConfig;
use runway::store::{ApprovalResolution, ApprovalStore};
use runway_common::ApprovalRequest;

pub async fn cmd_approvals(config: &RunwayConfig, run_id: Option<&str>, all: bool) -> Result<()> {
    let store = super::open_store(config)?;
    let approvals = store.list_approvals(run_id, !all).await?;
    if approvals.is_empty() {
        println!("No {}approvals.", if all { "" } else { "pending " });
        return Ok(());
    }
    for approval in approvals {
        println!(
            "{}  {:<12} {:<9} run {}  {}",
            approval.approval_id,
            approval.scope,
            approval.status.as_str(),
            approval.run_id,
            style(&approval.intent_summary).dim()
        );
    }
    Ok(())
}

pub async fn cmd_approve(config: &RunwayConfig, approval_id: &str, by: &str) -> Result<()> {
    let resolved = resolve(
        config,
        approval_id,
        ApprovalResolution::Approve {
            by: required(by, "--by")?,
        },
    )
    .await?;
    println!(
        "{} {} ({}) for run {}",
        style("Approved").green(),
        resolved.approval_id,
        resolved.scope,
        resolved.run_id
    );
    Ok(())
}

pub async fn cmd_reject(
    config: &RunwayConfig,
    approval_id: &str,
    by: &str,
    reason: Option<String>,
) -> Result<()> {
    let resolved = resolve(
        config,
        approval_id,
        ApprovalResolution::Reject {
            by: required(by, "--by")?,
            reason: reason.filter(|r| !r.trim().is_empty()),
        },
    )
    .await?;
    println!(
        "{} {} ({}) for run {}",
        style("Rejected").red(),
        resolved.approval_id,
        resolved.scope,
        resolved.run_id
    );
    Ok(())
}

/// Resolution is written to the database; the process executing the run
/// observes it on its next poll.
async fn resolve(
    config: &RunwayConfig,
    approval_id: &str,
    resolution: ApprovalResolution,
) -> Result<ApprovalRequest> {
    let store = super::open_store(config)?;
    store.resolve_approval(approval_id, resolution).await
}

fn required(value: &str, flag: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("{} must not be empty", flag);
    }
    Ok(trimmed.to_string())
}
