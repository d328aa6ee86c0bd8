//! Layered configuration for runway.
//!
//! Settings are read from `.runway/runway.toml` (or `--config`), then
//! overridden by environment variables, then by CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//!
//! [database]
//! path = ".runway/runway.db"
//!
//! [orchestrator]
//! approval_poll_secs = 5
//! cancel_poll_secs = 5
//! checks_timeout_secs = 1800
//! checks_poll_secs = 15
//!
//! [github]
//! api_url = "https://api.github.com"
//! merge_method = "squash"
//!
//! [sandbox]
//! image = "buildpack-deps:bookworm"
//! memory = "4g"
//! cpus = 2.0
//! command_timeout_secs = 1800
//!
//! [planner]
//! claude_cmd = "claude"
//! timeout_secs = 600
//!
//! [pipeline]
//! branch_prefix = "runway/"
//! patch_command = "claude --print --dangerously-skip-permissions < .runway/plan.md"
//! verify_commands = ["cargo fmt --check", "cargo test"]
//! environment = "production"
//!
//! [infra]
//! provision_url = "https://infra.example.com/provision"
//! deploy_url = "https://infra.example.com/deploy"
//!
//! [projects.web]
//! repo = "acme/web"
//! ```
//!
//! Secrets never live in the file: the GitHub token comes from
//! `GITHUB_TOKEN` and the infra token from `RUNWAY_INFRA_TOKEN`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = ".runway/runway.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunwayConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub planner: PlannerSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub infra: InfraSection,
    #[serde(default)]
    pub artifacts: ArtifactsSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub projects: HashMap<String, ProjectSection>,

    /// Populated from `GITHUB_TOKEN`, never from the file.
    #[serde(skip)]
    pub github_token: Option<String>,
    /// Populated from `RUNWAY_INFRA_TOKEN`, never from the file.
    #[serde(skip)]
    pub infra_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".runway/runway.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    /// How often a parked approval gate re-reads its approval row.
    #[serde(default = "default_approval_poll_secs")]
    pub approval_poll_secs: u64,
    /// How often a running execution checks for a cross-process cancel request.
    #[serde(default = "default_cancel_poll_secs")]
    pub cancel_poll_secs: u64,
    #[serde(default = "default_checks_timeout_secs")]
    pub checks_timeout_secs: u64,
    #[serde(default = "default_checks_poll_secs")]
    pub checks_poll_secs: u64,
}

fn default_approval_poll_secs() -> u64 {
    5
}

fn default_cancel_poll_secs() -> u64 {
    5
}

fn default_checks_timeout_secs() -> u64 {
    1800
}

fn default_checks_poll_secs() -> u64 {
    15
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            approval_poll_secs: default_approval_poll_secs(),
            cancel_poll_secs: default_cancel_poll_secs(),
            checks_timeout_secs: default_checks_timeout_secs(),
            checks_poll_secs: default_checks_poll_secs(),
        }
    }
}

impl OrchestratorSection {
    pub fn approval_poll(&self) -> Duration {
        Duration::from_secs(self.approval_poll_secs.max(1))
    }

    pub fn cancel_poll(&self) -> Duration {
        Duration::from_secs(self.cancel_poll_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Merge,
    #[default]
    Squash,
    Rebase,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Squash => "squash",
            Self::Rebase => "rebase",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSection {
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub merge_method: MergeMethod,
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_url: default_github_api_url(),
            merge_method: MergeMethod::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_docker_cmd")]
    pub docker_cmd: String,
    #[serde(default = "default_sandbox_image")]
    pub image: String,
    #[serde(default = "default_sandbox_memory")]
    pub memory: String,
    #[serde(default = "default_sandbox_cpus")]
    pub cpus: f64,
    /// Upper bound for a single command run inside the sandbox.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_sandbox_workdir")]
    pub workdir: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_docker_cmd() -> String {
    "docker".to_string()
}

fn default_sandbox_image() -> String {
    "buildpack-deps:bookworm".to_string()
}

fn default_sandbox_memory() -> String {
    "4g".to_string()
}

fn default_sandbox_cpus() -> f64 {
    2.0
}

fn default_command_timeout_secs() -> u64 {
    1800
}

fn default_sandbox_workdir() -> String {
    "/workspace".to_string()
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            docker_cmd: default_docker_cmd(),
            image: default_sandbox_image(),
            memory: default_sandbox_memory(),
            cpus: default_sandbox_cpus(),
            command_timeout_secs: default_command_timeout_secs(),
            workdir: default_sandbox_workdir(),
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerSection {
    #[serde(default = "default_claude_cmd")]
    pub claude_cmd: String,
    /// Upper bound for one planner invocation.
    #[serde(default = "default_planner_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_claude_cmd() -> String {
    "claude".to_string()
}

fn default_planner_timeout_secs() -> u64 {
    600
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            claude_cmd: default_claude_cmd(),
            timeout_secs: default_planner_timeout_secs(),
        }
    }
}

impl PlannerSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Shell command run inside the sandbox checkout to apply the plan,
    /// which is written to `.runway/plan.md` beforehand.
    #[serde(default = "default_patch_command")]
    pub patch_command: String,
    #[serde(default)]
    pub verify_commands: Vec<String>,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_branch_prefix() -> String {
    "runway/".to_string()
}

fn default_patch_command() -> String {
    "claude --print --dangerously-skip-permissions < .runway/plan.md".to_string()
}

fn default_environment() -> String {
    "production".to_string()
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            branch_prefix: default_branch_prefix(),
            patch_command: default_patch_command(),
            verify_commands: Vec::new(),
            environment: default_environment(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfraSection {
    #[serde(default)]
    pub provision_url: Option<String>,
    #[serde(default)]
    pub deploy_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsSection {
    #[serde(default = "default_artifacts_dir")]
    pub dir: PathBuf,
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from(".runway/artifacts")
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            dir: default_artifacts_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Directory for daily-rotated log files. Logs go to stderr only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// `owner/name` or any GitHub URL form of the repository.
    pub repo: String,
}

impl RunwayConfig {
    /// Parse configuration from TOML text without touching the environment.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse runway config")
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Resolve the full layered configuration.
    ///
    /// An explicit path must exist; the default path is optional.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::load(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = non_empty("RUNWAY_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(port) = non_empty("RUNWAY_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(url) = non_empty("GITHUB_API_URL") {
            self.github.api_url = url;
        }
        if let Some(cmd) = non_empty("CLAUDE_CMD") {
            self.planner.claude_cmd = cmd;
        }
        self.github_token = non_empty("GITHUB_TOKEN");
        self.infra_token = non_empty("RUNWAY_INFRA_TOKEN");
    }

    /// Repository slug configured for a project, if any.
    pub fn project_repo(&self, project_id: &str) -> Option<&str> {
        self.projects.get(project_id).map(|p| p.repo.as_str())
    }

    /// Human-readable warnings about settings that will make runs fail.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.github_token.is_none() {
            warnings.push(
                "GITHUB_TOKEN is not set; implementation runs will fail preflight".to_string(),
            );
        }
        if self.orchestrator.checks_poll_secs > self.orchestrator.checks_timeout_secs {
            warnings.push(format!(
                "checks_poll_secs ({}) exceeds checks_timeout_secs ({})",
                self.orchestrator.checks_poll_secs, self.orchestrator.checks_timeout_secs
            ));
        }
        if self.sandbox.cpus <= 0.0 {
            warnings.push(format!("sandbox.cpus must be positive, got {}", self.sandbox.cpus));
        }
        for (id, project) in &self.projects {
            if crate::integrations::github::parse_owner_repo(&project.repo).is_none() {
                warnings.push(format!(
                    "projects.{}.repo '{}' is not an owner/name pair or GitHub URL",
                    id, project.repo
                ));
            }
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config = RunwayConfig::parse("").unwrap();
        assert_eq!(config.server.port, 3141);
        assert_eq!(config.database.path, PathBuf::from(".runway/runway.db"));
        assert_eq!(config.orchestrator.checks_timeout_secs, 1800);
        assert_eq!(config.sandbox.memory, "4g");
        assert_eq!(config.github.merge_method, MergeMethod::Squash);
        assert!(config.pipeline.verify_commands.is_empty());
        assert!(config.projects.is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let config = RunwayConfig::parse(
            r#"
[server]
port = 8080

[orchestrator]
approval_poll_secs = 2
checks_timeout_secs = 600

[github]
merge_method = "rebase"

[pipeline]
branch_prefix = "bot/"
verify_commands = ["npm run lint", "npm test"]

[infra]
provision_url = "https://infra.test/provision"

[projects.web]
repo = "acme/web"
"#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.orchestrator.approval_poll(), Duration::from_secs(2));
        assert_eq!(config.orchestrator.cancel_poll_secs, 5);
        assert_eq!(config.github.merge_method, MergeMethod::Rebase);
        assert_eq!(config.pipeline.branch_prefix, "bot/");
        assert_eq!(config.pipeline.verify_commands.len(), 2);
        assert_eq!(
            config.infra.provision_url.as_deref(),
            Some("https://infra.test/provision")
        );
        assert!(config.infra.deploy_url.is_none());
        assert_eq!(config.project_repo("web"), Some("acme/web"));
        assert_eq!(config.project_repo("api"), None);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(RunwayConfig::parse("[server\nport = 1").is_err());
        assert!(RunwayConfig::parse("[server]\nport = \"high\"").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = RunwayConfig::parse("[server]\nport = 8080").unwrap();
        config.apply_env(|key| match key {
            "RUNWAY_PORT" => Some("9000".to_string()),
            "RUNWAY_DB_PATH" => Some("/tmp/r.db".to_string()),
            "GITHUB_TOKEN" => Some("ghp_test".to_string()),
            "CLAUDE_CMD" => Some("".to_string()),
            _ => None,
        });
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.database.path, PathBuf::from("/tmp/r.db"));
        assert_eq!(config.github_token.as_deref(), Some("ghp_test"));
        assert_eq!(config.planner.claude_cmd, "claude");
        assert_eq!(config.planner.timeout(), Duration::from_secs(600));
        assert!(config.infra_token.is_none());
    }

    #[test]
    fn test_resolve_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(RunwayConfig::resolve(Some(&missing)).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runway.toml");
        std::fs::write(&path, "[database]\npath = \"data/x.db\"\n").unwrap();
        let config = RunwayConfig::load(&path).unwrap();
        assert_eq!(config.database.path, PathBuf::from("data/x.db"));
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = RunwayConfig::parse(
            r#"
[orchestrator]
checks_poll_secs = 100
checks_timeout_secs = 10

[projects.bad]
repo = "not a repo"
"#,
        )
        .unwrap();
        config.github_token = None;
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("GITHUB_TOKEN")));
        assert!(warnings.iter().any(|w| w.contains("checks_poll_secs")));
        assert!(warnings.iter().any(|w| w.contains("projects.bad.repo")));

        config.github_token = Some("t".into());
        config.orchestrator.checks_poll_secs = 5;
        config.projects.clear();
        assert!(config.validate().is_empty());
    }
}
