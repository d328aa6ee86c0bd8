use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::warn;

use super::{PlanDraft, PlanRequest, Planner};

const PLANNER_SYSTEM_PROMPT: &str = r#"You are a software engineering planner. Turn the requested change into an implementation plan for a coding agent that will work in a fresh checkout of the repository.

You MUST respond with valid JSON only (no markdown fences, no explanation) matching this schema:
{
  "planMarkdown": "Step-by-step plan in markdown. Name the files to touch.",
  "prTitle": "Short imperative pull request title (under 72 characters)",
  "prBody": "Pull request description in markdown",
  "commitMessage": "Commit message: summary line, blank line, body"
}

Rules:
- Keep the plan scoped to the request. Do not add unrelated refactors.
- Mention the tests that must pass or be added.
"#;

impl PlanDraft {
    /// Parse planner output, tolerating prose or fences around the JSON object.
    pub fn parse(raw: &str) -> Result<Self> {
        let cleaned = match (raw.find('{'), raw.rfind('}')) {
            (Some(start), Some(end)) if start < end => &raw[start..=end],
            _ => raw,
        };
        let draft: PlanDraft =
            serde_json::from_str(cleaned).context("Failed to parse planner response as JSON")?;
        if draft.pr_title.trim().is_empty() {
            anyhow::bail!("Planner response has an empty prTitle");
        }
        Ok(draft)
    }

    /// A usable draft built from the intent alone.
    pub fn fallback(request: &PlanRequest) -> Self {
        let intent = request.intent.trim();
        let summary = intent
            .lines()
            .next()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.chars().take(72).collect::<String>())
            .unwrap_or_else(|| format!("Runway changes for {}", request.project_id));
        PlanDraft {
            plan_markdown: format!("# Plan\n\nImplement the following request:\n\n{}\n", intent),
            pr_title: summary.clone(),
            pr_body: format!(
                "Automated change from run `{}`.\n\n## Request\n\n{}\n",
                request.run_id, intent
            ),
            commit_message: format!("{}\n\nRun: {}", summary, request.run_id),
        }
    }
}

/// Plans through the `claude` CLI in print mode.
///
/// The child process is killed when the call times out or its future is
/// dropped, which is how a run cancellation reaches it.
pub struct ClaudePlanner {
    claude_cmd: String,
    timeout: Duration,
}

impl ClaudePlanner {
    pub fn new(claude_cmd: impl Into<String>, timeout: Duration) -> Self {
        Self {
            claude_cmd: claude_cmd.into(),
            timeout,
        }
    }

    fn build_prompt(request: &PlanRequest) -> String {
        format!(
            "Plan this change.\n\n\
             ## Request\n\
             {}\n\n\
             ## Repository\n\
             **Name:** {}\n\
             **Default branch:** {}\n\n\
             Respond with JSON only.",
            request.intent,
            request.repo.full_name(),
            request.repo.default_branch,
        )
    }

    async fn call_claude(&self, prompt: &str) -> Result<String> {
        let child = Command::new(&self.claude_cmd)
            .args([
                "--print",
                "--output-format",
                "text",
                "-p",
                prompt,
                "--system",
                PLANNER_SYSTEM_PROMPT,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to run claude CLI for planning")?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Claude planner timed out after {}s",
                    self.timeout.as_secs()
                )
            })?
            .context("Failed to wait for claude CLI")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Claude planner failed: {}", stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Planner for ClaudePlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanDraft> {
        let response = self.call_claude(&Self::build_prompt(request)).await?;
        match PlanDraft::parse(&response) {
            Ok(draft) => Ok(draft),
            Err(e) => {
                warn!(
                    run_id = %request.run_id,
                    error = %e,
                    raw = %response.chars().take(500).collect::<String>(),
                    "invalid planner response, falling back to intent-only plan"
                );
                Ok(PlanDraft::fallback(request))
            }
        }
    }
}
