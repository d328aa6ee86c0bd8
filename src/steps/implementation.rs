//! The implementation pipeline: plan, patch and verify in a sandbox, open a
//! pull request, then merge, provision and deploy behind approval gates.

use std::sync::Arc;

use anyhow::Result;
use runway_common::Run;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::{OUTPUT_TAIL, StepServices};
use crate::errors::StepFailure;
use crate::integrations::sandbox::shell_quote;
use crate::integrations::{
    CommandOutput, InfraRequest, MergeResult, PlanDraft, PlanRequest, PullRequest,
    PullRequestSpec, RepoContext, SandboxFile, SandboxProvider, SandboxSession,
};
use crate::orchestrator::pipeline::*;
use crate::orchestrator::{ApprovalMeta, RunContext};
use crate::store::StepMeta;

const PLAN_PATH: &str = ".runway/plan.md";
const COMMIT_MESSAGE_PATH: &str = ".runway/COMMIT_MSG";
const COMMIT_IDENTITY: &str = "-c user.name=runway -c user.email=runway@users.noreply.github.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkout {
    pub sandbox_id: String,
    pub branch: String,
    pub workdir: String,
    pub base_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchResult {
    pub commit_sha: String,
    pub files_changed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResult {
    pub stopped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A run's sandbox, referenced by its durable id and attached on first use.
pub struct SandboxHandle<'a> {
    provider: &'a dyn SandboxProvider,
    sandbox_id: String,
    session: OnceCell<Arc<dyn SandboxSession>>,
}

impl<'a> SandboxHandle<'a> {
    pub fn new(
        provider: &'a dyn SandboxProvider,
        sandbox_id: String,
        session: OnceCell<Arc<dyn SandboxSession>>,
    ) -> Self {
        Self {
            provider,
            sandbox_id,
            session,
        }
    }

    pub async fn session(&self) -> Result<Arc<dyn SandboxSession>> {
        let session = self
            .session
            .get_or_try_init(|| self.provider.attach(&self.sandbox_id))
            .await?;
        Ok(session.clone())
    }

    pub async fn stop(&self) -> Result<()> {
        self.session().await?.stop().await
    }

    /// Compensating stop: failures are logged, never returned.
    pub async fn stop_quietly(&self, run_id: &str) {
        if let Err(e) = self.stop().await {
            warn!(
                run_id = %run_id,
                sandbox_id = %self.sandbox_id,
                error = %format!("{:#}", e),
                "failed to stop sandbox"
            );
        }
    }
}

pub async fn run(ctx: &mut RunContext, services: &StepServices, run: &Run) -> Result<()> {
    let settings = &services.settings;

    ctx.run_step(StepMeta::tool(IMPL_PREFLIGHT, "Preflight checks"), || {
        preflight(services, run)
    })
    .await?;

    let repo: RepoContext = ctx
        .run_step(StepMeta::tool(IMPL_REPO_ENSURE, "Resolve repository"), || {
            services.repos.resolve(&run.project_id)
        })
        .await?;

    let created = OnceCell::new();
    let checkout = match ctx
        .run_step(
            StepMeta::sandbox(IMPL_SANDBOX_CHECKOUT, "Check out repository in sandbox"),
            || checkout(services, run, &repo, &created),
        )
        .await
    {
        Ok(checkout) => checkout,
        Err(e) => {
            if let Some(session) = created.get() {
                stop_session_quietly(&run.id, session.as_ref()).await;
            }
            return Err(e);
        }
    };
    let sandbox = SandboxHandle::new(
        services.sandboxes.as_ref(),
        checkout.sandbox_id.clone(),
        created,
    );

    let pr = match change_to_pull_request(ctx, services, run, &repo, &checkout, &sandbox).await {
        Ok(pr) => pr,
        Err(e) => {
            sandbox.stop_quietly(&run.id).await;
            return Err(e);
        }
    };

    ctx.run_step(StepMeta::sandbox(IMPL_SANDBOX_STOP, "Stop sandbox"), || {
        stop_sandbox(run, &sandbox)
    })
    .await?;

    ctx.await_approval(
        ApprovalMeta::new(
            APPROVAL_MERGE,
            SCOPE_MERGE,
            format!(
                "Merge pull request #{} into {} of {}",
                pr.number,
                repo.default_branch,
                repo.full_name()
            ),
        )
        .with_metadata(json!({ "pullRequest": pr })),
    )
    .await?;
    ctx.resume_running().await?;

    ctx.run_step(
        StepMeta::external_poll(REPO_CHECKS, "Wait for CI checks")
            .with_inputs(json!({ "sha": pr.head_sha })),
        || services
            .code_host
            .poll_checks_until_terminal(&repo, &pr.head_sha, &settings.checks),
    )
    .await?;

    let merge: MergeResult = ctx
        .run_step(
            StepMeta::tool(REPO_MERGE, "Merge pull request").with_inputs(json!({
                "number": pr.number,
                "method": settings.merge_method.as_str(),
            })),
            || services
                .code_host
                .merge_pull_request(&repo, pr.number, settings.merge_method),
        )
        .await?;

    ctx.await_approval(ApprovalMeta::new(
        APPROVAL_PROVISION,
        SCOPE_PROVISION,
        format!(
            "Provision {} infrastructure for {}",
            settings.environment,
            repo.full_name()
        ),
    ))
    .await?;
    ctx.resume_running().await?;

    let provision = infra_request(run, INFRA_PROVISION, services, &repo, &merge);
    ctx.run_step(
        StepMeta::tool(INFRA_PROVISION, "Provision infrastructure"),
        || services.infra.provision(&provision),
    )
    .await?;

    ctx.await_approval(
        ApprovalMeta::new(
            APPROVAL_DEPLOY_PROD,
            SCOPE_DEPLOY_PROD,
            format!(
                "Deploy {} to {}",
                merge.sha.as_deref().unwrap_or(&pr.head_sha),
                settings.environment
            ),
        )
        .with_metadata(json!({ "environment": settings.environment })),
    )
    .await?;
    ctx.resume_running().await?;

    let deploy = infra_request(run, DEPLOY_PRODUCTION, services, &repo, &merge);
    ctx.run_step(
        StepMeta::tool(DEPLOY_PRODUCTION, "Deploy to production"),
        || services.infra.deploy(&deploy),
    )
    .await?;

    info!(run_id = %run.id, pr = pr.number, "implementation pipeline finished");
    Ok(())
}

/// Steps that hold the sandbox: plan, patch, verify, push and open the PR.
async fn change_to_pull_request(
    ctx: &mut RunContext,
    services: &StepServices,
    run: &Run,
    repo: &RepoContext,
    checkout: &Checkout,
    sandbox: &SandboxHandle<'_>,
) -> Result<PullRequest> {
    let request = PlanRequest {
        run_id: run.id.clone(),
        project_id: run.project_id.clone(),
        intent: run.intent.clone(),
        repo: repo.clone(),
    };
    let plan: PlanDraft = ctx
        .run_step(StepMeta::llm(IMPL_PLAN, "Plan change"), || {
            services.planner.plan(&request)
        })
        .await?;

    ctx.run_step(StepMeta::sandbox(IMPL_PATCH, "Apply patch"), || {
        apply_patch(services, checkout, sandbox, &plan)
    })
    .await?;

    ctx.run_step(StepMeta::sandbox(IMPL_VERIFY, "Verify changes"), || {
        verify(services, sandbox)
    })
    .await?;

    ctx.run_step(StepMeta::tool(IMPL_PR_OPEN, "Open pull request"), || {
        push_and_open(services, repo, checkout, sandbox, &plan)
    })
    .await
}

async fn preflight(services: &StepServices, run: &Run) -> Result<Value> {
    if !services.settings.github_token_configured {
        return Err(StepFailure::Preflight("GITHUB_TOKEN is not configured".to_string()).into());
    }
    let repository = services
        .repos
        .repository_slug(&run.project_id)
        .ok_or_else(|| {
            StepFailure::Preflight(format!(
                "Project {} has no repository configured",
                run.project_id
            ))
        })?;
    Ok(json!({ "projectId": run.project_id, "repository": repository }))
}

async fn checkout(
    services: &StepServices,
    run: &Run,
    repo: &RepoContext,
    created: &OnceCell<Arc<dyn SandboxSession>>,
) -> Result<Checkout> {
    let session = services.sandboxes.create(&run.id).await?;
    let _ = created.set(session.clone());
    let sandbox = session.as_ref();

    let branch = services.settings.branch_for(&run.id);
    run_checked(
        sandbox,
        &format!(
            "git clone --quiet --branch {} {} .",
            shell_quote(&repo.default_branch),
            authenticated_clone_url(&repo.clone_url)
        ),
    )
    .await?;
    run_checked(sandbox, &format!("git checkout -q -b {}", shell_quote(&branch))).await?;
    run_checked(sandbox, "mkdir -p .git/info && echo '.runway/' >> .git/info/exclude").await?;
    let base_sha = sandbox.finalize().await?;

    Ok(Checkout {
        sandbox_id: sandbox.id().to_string(),
        branch,
        workdir: sandbox.workdir().to_string(),
        base_sha,
    })
}

async fn apply_patch(
    services: &StepServices,
    checkout: &Checkout,
    sandbox: &SandboxHandle<'_>,
    plan: &PlanDraft,
) -> Result<PatchResult> {
    let session = sandbox.session().await?;
    let session = session.as_ref();

    // A retried attempt starts again from the checked-out base.
    run_checked(
        session,
        &format!("git reset -q --hard {} && git clean -qfd", shell_quote(&checkout.base_sha)),
    )
    .await?;
    session
        .write_files(&[
            SandboxFile {
                path: PLAN_PATH.to_string(),
                contents: plan.plan_markdown.clone(),
            },
            SandboxFile {
                path: COMMIT_MESSAGE_PATH.to_string(),
                contents: plan.commit_message.clone(),
            },
        ])
        .await?;

    run_checked(session, &services.settings.patch_command).await?;

    let status = run_checked(session, "git add -A && git status --porcelain").await?;
    let files_changed = changed_files(&status.stdout);
    if files_changed.is_empty() {
        return Err(StepFailure::EmptyPatch.into());
    }
    run_checked(
        session,
        &format!("git {} commit -q -F {}", COMMIT_IDENTITY, COMMIT_MESSAGE_PATH),
    )
    .await?;
    let commit_sha = session.finalize().await?;

    Ok(PatchResult {
        commit_sha,
        files_changed,
    })
}

async fn verify(services: &StepServices, sandbox: &SandboxHandle<'_>) -> Result<Value> {
    let commands = &services.settings.verify_commands;
    if commands.is_empty() {
        return Ok(json!({ "commands": [], "skipped": true }));
    }
    let session = sandbox.session().await?;
    let mut passed = Vec::with_capacity(commands.len());
    for command in commands {
        let output = session.run_command(command).await?;
        if !output.success() {
            return Err(StepFailure::VerifyFailed {
                command: command.clone(),
                exit_code: output.exit_code,
                output: output.tail(OUTPUT_TAIL),
            }
            .into());
        }
        passed.push(command.clone());
    }
    Ok(json!({ "commands": passed }))
}

async fn push_and_open(
    services: &StepServices,
    repo: &RepoContext,
    checkout: &Checkout,
    sandbox: &SandboxHandle<'_>,
    plan: &PlanDraft,
) -> Result<PullRequest> {
    let session = sandbox.session().await?;
    let push = session
        .run_command(&format!(
            "git push --quiet --force -u origin {}",
            shell_quote(&checkout.branch)
        ))
        .await?;
    if !push.success() {
        return Err(StepFailure::PushFailed {
            branch: checkout.branch.clone(),
            message: push.tail(OUTPUT_TAIL),
        }
        .into());
    }

    services
        .code_host
        .open_pull_request(
            repo,
            &PullRequestSpec {
                title: plan.pr_title.clone(),
                body: plan.pr_body.clone(),
                head: checkout.branch.clone(),
                base: repo.default_branch.clone(),
            },
        )
        .await
}

async fn stop_sandbox(run: &Run, sandbox: &SandboxHandle<'_>) -> Result<StopResult> {
    match sandbox.stop().await {
        Ok(()) => Ok(StopResult {
            stopped: true,
            error: None,
        }),
        Err(e) => {
            let error = format!("{:#}", e);
            warn!(run_id = %run.id, error = %error, "sandbox stop failed");
            Ok(StopResult {
                stopped: false,
                error: Some(error),
            })
        }
    }
}

async fn stop_session_quietly(run_id: &str, session: &dyn SandboxSession) {
    if let Err(e) = session.stop().await {
        warn!(
            run_id = %run_id,
            sandbox_id = %session.id(),
            error = %format!("{:#}", e),
            "failed to stop sandbox"
        );
    }
}

async fn run_checked(sandbox: &dyn SandboxSession, command: &str) -> Result<CommandOutput> {
    let output = sandbox.run_command(command).await?;
    if !output.success() {
        return Err(StepFailure::SandboxCommand {
            command: command.to_string(),
            exit_code: output.exit_code,
            output: output.tail(OUTPUT_TAIL),
        }
        .into());
    }
    Ok(output)
}

fn infra_request(
    run: &Run,
    step_id: &str,
    services: &StepServices,
    repo: &RepoContext,
    merge: &MergeResult,
) -> InfraRequest {
    InfraRequest {
        run_id: run.id.clone(),
        step_id: step_id.to_string(),
        project_id: run.project_id.clone(),
        environment: services.settings.environment.clone(),
        repository: repo.full_name(),
        git_ref: merge.sha.clone(),
    }
}

/// Clone URL with the token expanded by the sandbox's shell, never by us.
fn authenticated_clone_url(clone_url: &str) -> String {
    match clone_url.strip_prefix("https://") {
        Some(rest) => format!("\"https://x-access-token:${{GITHUB_TOKEN}}@{}\"", rest),
        None => shell_quote(clone_url),
    }
}

/// Paths from `git status --porcelain` output.
fn changed_files(porcelain: &str) -> Vec<String> {
    porcelain
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let path = &line[3..];
            match path.split_once(" -> ") {
                Some((_, renamed)) => renamed.to_string(),
                None => path.to_string(),
            }
        })
        .collect()
}
