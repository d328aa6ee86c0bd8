//! Docker-backed sandboxes driven through the `docker` CLI.
//!
//! Each run gets one long-lived container (`sleep infinity`) labeled with
//! its run id. Commands are `docker exec`'d into it, so a sandbox survives
//! a restart of this process and can be reattached by container id.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{CommandOutput, SandboxFile, SandboxProvider, SandboxSession};
use crate::config::SandboxSection;
use crate::errors::StepFailure;

pub const RUN_LABEL: &str = "runway.run";

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '='))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub struct DockerSandboxProvider {
    settings: SandboxSection,
    github_token: Option<String>,
}

impl DockerSandboxProvider {
    pub fn new(settings: SandboxSection, github_token: Option<String>) -> Self {
        Self {
            settings,
            github_token,
        }
    }

    fn run_args(&self, run_id: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--label".to_string(),
            format!("{}={}", RUN_LABEL, run_id),
            "--memory".to_string(),
            self.settings.memory.clone(),
            "--cpus".to_string(),
            self.settings.cpus.to_string(),
            "-w".to_string(),
            self.settings.workdir.clone(),
        ];
        if self.github_token.is_some() {
            // Value is inherited from the docker CLI's environment so the
            // token never appears in argv.
            args.push("-e".to_string());
            args.push("GITHUB_TOKEN".to_string());
        }
        let mut env: Vec<_> = self.settings.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.settings.image.clone());
        args.push("sleep".to_string());
        args.push("infinity".to_string());
        args
    }

    fn session(&self, container_id: String) -> Arc<dyn SandboxSession> {
        Arc::new(DockerSandbox {
            docker_cmd: self.settings.docker_cmd.clone(),
            container_id,
            workdir: self.settings.workdir.clone(),
            command_timeout: Duration::from_secs(self.settings.command_timeout_secs),
        })
    }
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    async fn create(&self, run_id: &str) -> Result<Arc<dyn SandboxSession>> {
        let mut cmd = Command::new(&self.settings.docker_cmd);
        cmd.args(self.run_args(run_id));
        if let Some(token) = &self.github_token {
            cmd.env("GITHUB_TOKEN", token);
        }
        let output = cmd
            .output()
            .await
            .context("Failed to run docker; is it installed and on PATH?")?;
        if !output.status.success() {
            anyhow::bail!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            anyhow::bail!("docker run returned no container id");
        }
        info!(run_id = %run_id, sandbox_id = %container_id, image = %self.settings.image, "sandbox created");
        Ok(self.session(container_id))
    }

    async fn attach(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxSession>> {
        let output = Command::new(&self.settings.docker_cmd)
            .args(["inspect", "--format", "{{.State.Running}}", sandbox_id])
            .output()
            .await
            .context("Failed to run docker inspect")?;
        if !output.status.success() {
            anyhow::bail!(
                "Sandbox {} is gone: {}",
                sandbox_id,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        if String::from_utf8_lossy(&output.stdout).trim() != "true" {
            anyhow::bail!("Sandbox {} is not running", sandbox_id);
        }
        debug!(sandbox_id = %sandbox_id, "reattached to sandbox");
        Ok(self.session(sandbox_id.to_string()))
    }
}

struct DockerSandbox {
    docker_cmd: String,
    container_id: String,
    workdir: String,
    command_timeout: Duration,
}

impl DockerSandbox {
    fn exec(&self, interactive: bool, script: &str) -> Command {
        let mut cmd = Command::new(&self.docker_cmd);
        cmd.arg("exec");
        if interactive {
            cmd.arg("-i");
        }
        cmd.args(["-w", &self.workdir, &self.container_id, "sh", "-lc", script])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl SandboxSession for DockerSandbox {
    fn id(&self) -> &str {
        &self.container_id
    }

    fn workdir(&self) -> &str {
        &self.workdir
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        debug!(sandbox_id = %self.container_id, command = %command, "sandbox exec");
        let child = self
            .exec(false, command)
            .stdin(Stdio::null())
            .spawn()
            .context("Failed to spawn docker exec")?;
        let output = match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await
        {
            Ok(result) => result.context("Failed to wait for docker exec")?,
            Err(_) => {
                return Err(StepFailure::SandboxCommand {
                    command: command.to_string(),
                    exit_code: -1,
                    output: format!("timed out after {}s", self.command_timeout.as_secs()),
                }
                .into());
            }
        };
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn write_files(&self, files: &[SandboxFile]) -> Result<()> {
        for file in files {
            let path = shell_quote(&file.path);
            let script = format!("mkdir -p \"$(dirname {path})\" && cat > {path}");
            let mut child = self
                .exec(true, &script)
                .stdin(Stdio::piped())
                .spawn()
                .context("Failed to spawn docker exec for file write")?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(file.contents.as_bytes())
                    .await
                    .with_context(|| format!("Failed to stream {} into sandbox", file.path))?;
            }
            let output = child
                .wait_with_output()
                .await
                .context("Failed to wait for file write")?;
            if !output.status.success() {
                anyhow::bail!(
                    "Failed to write {} in sandbox: {}",
                    file.path,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }
        Ok(())
    }

    async fn finalize(&self) -> Result<String> {
        let output = self.run_command("git rev-parse HEAD").await?;
        if !output.success() {
            return Err(StepFailure::SandboxCommand {
                command: "git rev-parse HEAD".to_string(),
                exit_code: output.exit_code,
                output: output.tail(2000),
            }
            .into());
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn stop(&self) -> Result<()> {
        let output = Command::new(&self.docker_cmd)
            .args(["rm", "-f", &self.container_id])
            .output()
            .await
            .context("Failed to run docker rm")?;
        if output.status.success() {
            info!(sandbox_id = %self.container_id, "sandbox stopped");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            warn!(sandbox_id = %self.container_id, "sandbox already removed");
            return Ok(());
        }
        anyhow::bail!("docker rm failed: {}", stderr.trim())
    }
}
