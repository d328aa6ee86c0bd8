//! External collaborators invoked by step bodies.
//!
//! The traits are the testability seams: real implementations live in the
//! submodules (GitHub REST, docker CLI sandboxes, the Claude CLI planner,
//! infra webhooks, artifact files) and tests substitute fakes.

pub mod artifacts;
pub mod github;
pub mod infra;
pub mod planner;
pub mod sandbox;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::MergeMethod;

pub use artifacts::FileArtifactStore;
pub use github::{GitHubClient, GitHubRepoResolver};
pub use infra::WebhookInfraClient;
pub use planner::ClaudePlanner;
pub use sandbox::DockerSandboxProvider;

/// Where a project's code lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoContext {
    pub owner: String,
    pub name: String,
    pub clone_url: String,
    pub default_branch: String,
}

impl RepoContext {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[async_trait]
pub trait RepoResolver: Send + Sync {
    /// The configured `owner/name` for a project, without any network call.
    fn repository_slug(&self, project_id: &str) -> Option<String>;

    async fn resolve(&self, project_id: &str) -> Result<RepoContext>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The last `max_chars` characters of combined output, for error payloads.
    pub fn tail(&self, max_chars: usize) -> String {
        let combined = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else if self.stdout.trim().is_empty() {
            self.stderr.trim().to_string()
        } else {
            format!("{}\n{}", self.stdout.trim(), self.stderr.trim())
        };
        let count = combined.chars().count();
        if count <= max_chars {
            combined
        } else {
            combined.chars().skip(count - max_chars).collect()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxFile {
    /// Relative to the sandbox working directory, or absolute.
    pub path: String,
    pub contents: String,
}

/// One isolated workspace owned by a run.
#[async_trait]
pub trait SandboxSession: Send + Sync {
    fn id(&self) -> &str;

    fn workdir(&self) -> &str;

    /// Run a shell command in the working directory.
    async fn run_command(&self, command: &str) -> Result<CommandOutput>;

    async fn write_files(&self, files: &[SandboxFile]) -> Result<()>;

    /// Flush the workspace and report the checked-out commit.
    async fn finalize(&self) -> Result<String>;

    /// Tear the sandbox down. Stopping an already stopped sandbox succeeds.
    async fn stop(&self) -> Result<()>;
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, run_id: &str) -> Result<Arc<dyn SandboxSession>>;

    /// Reattach to a sandbox created earlier, possibly by another process.
    async fn attach(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxSession>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub run_id: String,
    pub project_id: String,
    pub intent: String,
    pub repo: RepoContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDraft {
    pub plan_markdown: String,
    pub pr_title: String,
    pub pr_body: String,
    pub commit_message: String,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanDraft>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestSpec {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub head_sha: String,
    pub head_branch: String,
}

/// Bounds for waiting on CI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub conclusion: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecksSummary {
    pub total: usize,
    pub checks: Vec<CheckResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub merged: bool,
    pub sha: Option<String>,
    pub message: String,
}

#[async_trait]
pub trait CodeHost: Send + Sync {
    /// Open a pull request, reusing an open one for the same head branch.
    async fn open_pull_request(&self, repo: &RepoContext, spec: &PullRequestSpec)
    -> Result<PullRequest>;

    /// Wait for every check on `sha` to finish, bounded by `policy.timeout`.
    async fn poll_checks_until_terminal(
        &self,
        repo: &RepoContext,
        sha: &str,
        policy: &ChecksPolicy,
    ) -> Result<ChecksSummary>;

    async fn merge_pull_request(
        &self,
        repo: &RepoContext,
        number: u64,
        method: MergeMethod,
    ) -> Result<MergeResult>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfraRequest {
    pub run_id: String,
    pub step_id: String,
    pub project_id: String,
    pub environment: String,
    pub repository: String,
    pub git_ref: Option<String>,
}

impl InfraRequest {
    /// Key that lets the receiving service drop retried deliveries.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.run_id, self.step_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfraOutcome {
    pub operation: String,
    pub environment: String,
    #[serde(default)]
    pub response: Value,
}

#[async_trait]
pub trait InfraClient: Send + Sync {
    async fn provision(&self, request: &InfraRequest) -> Result<InfraOutcome>;

    async fn deploy(&self, request: &InfraRequest) -> Result<InfraOutcome>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist the rendered run summary and return where it was written.
    async fn save_run_summary(&self, run_id: &str, markdown: &str) -> Result<String>;
}
