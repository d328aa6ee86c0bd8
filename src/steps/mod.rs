//! Step bodies for the research and implementation pipelines.
//!
//! Bodies reach the outside world only through the collaborator traits in
//! [`crate::integrations`], bundled here as [`StepServices`].

pub mod implementation;
pub mod research;

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use runway_common::{Run, RunStep};
use serde_json::{Value, json};

use crate::config::{MergeMethod, RunwayConfig};
use crate::integrations::{
    ArtifactStore, ChecksPolicy, ClaudePlanner, CodeHost, DockerSandboxProvider,
    FileArtifactStore, GitHubClient, GitHubRepoResolver, InfraClient, Planner, RepoResolver,
    SandboxProvider, WebhookInfraClient,
};
use crate::orchestrator::RunContext;
use crate::orchestrator::pipeline::{ARTIFACT_RUN_SUMMARY, RUN_COMPLETE};
use crate::store::{RunStore, StepMeta};

/// Characters of command output kept in step error payloads.
pub(crate) const OUTPUT_TAIL: usize = 4000;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub github_token_configured: bool,
    pub branch_prefix: String,
    pub patch_command: String,
    pub verify_commands: Vec<String>,
    pub environment: String,
    pub merge_method: MergeMethod,
    pub checks: ChecksPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &RunwayConfig) -> Self {
        Self {
            github_token_configured: config.github_token.is_some(),
            branch_prefix: config.pipeline.branch_prefix.clone(),
            patch_command: config.pipeline.patch_command.clone(),
            verify_commands: config.pipeline.verify_commands.clone(),
            environment: config.pipeline.environment.clone(),
            merge_method: config.github.merge_method,
            checks: ChecksPolicy {
                timeout: Duration::from_secs(config.orchestrator.checks_timeout_secs),
                interval: Duration::from_secs(config.orchestrator.checks_poll_secs.max(1)),
            },
        }
    }

    pub fn branch_for(&self, run_id: &str) -> String {
        format!("{}{}", self.branch_prefix, run_id)
    }
}

/// Collaborators available to step bodies.
#[derive(Clone)]
pub struct StepServices {
    pub repos: Arc<dyn RepoResolver>,
    pub code_host: Arc<dyn CodeHost>,
    pub sandboxes: Arc<dyn SandboxProvider>,
    pub planner: Arc<dyn Planner>,
    pub infra: Arc<dyn InfraClient>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub settings: PipelineSettings,
}

impl StepServices {
    /// Wire the shipped collaborator implementations from configuration.
    pub fn from_config(config: &RunwayConfig) -> Result<Self> {
        let github = Arc::new(GitHubClient::new(
            config.github.api_url.clone(),
            config.github_token.clone(),
        )?);
        let projects = config
            .projects
            .iter()
            .map(|(id, project)| (id.clone(), project.repo.clone()))
            .collect();

        Ok(Self {
            repos: Arc::new(GitHubRepoResolver::new(github.clone(), projects)),
            code_host: github,
            sandboxes: Arc::new(DockerSandboxProvider::new(
                config.sandbox.clone(),
                config.github_token.clone(),
            )),
            planner: Arc::new(ClaudePlanner::new(
                config.planner.claude_cmd.clone(),
                config.planner.timeout(),
            )),
            infra: Arc::new(WebhookInfraClient::new(
                &config.infra,
                config.infra_token.clone(),
            )?),
            artifacts: Arc::new(FileArtifactStore::new(config.artifacts.dir.clone())),
            settings: PipelineSettings::from_config(config),
        })
    }
}

/// The tail shared by every pipeline: `run.complete` then `artifact.run_summary`.
pub async fn finish_pipeline(ctx: &mut RunContext, services: &StepServices, run: &Run) -> Result<()> {
    ctx.run_step(StepMeta::tool(RUN_COMPLETE, "Complete run"), || complete_run(run))
        .await?;

    let store = ctx.store().clone();
    ctx.run_step(
        StepMeta::tool(ARTIFACT_RUN_SUMMARY, "Write run summary"),
        || write_summary(store, services.artifacts.as_ref(), run),
    )
    .await?;
    Ok(())
}

async fn write_summary(
    store: Arc<dyn RunStore>,
    artifacts: &dyn ArtifactStore,
    run: &Run,
) -> Result<Value> {
    let steps = store.list_run_steps(&run.id).await?;
    let markdown = render_summary(run, &steps);
    let path = artifacts.save_run_summary(&run.id, &markdown).await?;
    Ok(json!({ "path": path, "steps": steps.len() }))
}

async fn complete_run(run: &Run) -> Result<Value> {
    Ok(json!({
        "runId": run.id,
        "kind": run.kind,
        "completedAt": Utc::now(),
    }))
}

/// Markdown summary of a run's steps.
pub fn render_summary(run: &Run, steps: &[RunStep]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Run {}\n", run.id);
    let _ = writeln!(out, "- **Kind:** {}", run.kind);
    let _ = writeln!(out, "- **Project:** {}", run.project_id);
    let _ = writeln!(out, "- **Workflow:** {}", run.workflow_run_id);
    if !run.intent.trim().is_empty() {
        let _ = writeln!(out, "- **Intent:** {}", run.intent.trim());
    }
    let _ = writeln!(out, "\n## Steps\n");
    let _ = writeln!(out, "| # | Step | Kind | Status | Attempts |");
    let _ = writeln!(out, "|---|------|------|--------|----------|");
    for step in steps {
        let _ = writeln!(
            out,
            "| {} | {} (`{}`) | {} | {} | {} |",
            step.position + 1,
            step.step_name,
            step.step_id,
            step.step_kind,
            step.status,
            step.attempts
        );
    }
    let failures: Vec<&RunStep> = steps.iter().filter(|s| s.error.is_some()).collect();
    if !failures.is_empty() {
        let _ = writeln!(out, "\n## Errors\n");
        for step in failures {
            if let Some(error) = &step.error {
                let _ = writeln!(out, "- `{}`: {}", step.step_id, error.message);
            }
        }
    }
    out
}
