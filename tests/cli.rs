//! End-to-end tests of the `runway` binary against a temporary database.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use tempfile::TempDir;

/// A `runway` command isolated in `dir`, with no ambient credentials.
fn runway(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("runway");
    cmd.current_dir(dir.path())
        .env_remove("GITHUB_TOKEN")
        .env_remove("RUNWAY_DB_PATH")
        .env_remove("RUNWAY_INFRA_TOKEN")
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(dir.path().join("runway.toml"))
        .arg("--db")
        .arg(dir.path().join("runway.db"));
    cmd
}

fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    let config = format!(
        r#"
[orchestrator]
approval_poll_secs = 1
cancel_poll_secs = 1

[artifacts]
dir = "{}"

[projects.web]
repo = "acme/web"
"#,
        dir.path().join("artifacts").display()
    );
    fs::write(dir.path().join("runway.toml"), config).unwrap();
    dir
}

fn stdout_lines(output: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(output)
        .lines()
        .filter(|line| line.starts_with('{'))
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn submit(dir: &TempDir, kind: &str) -> String {
    let output = runway(dir)
        .args(["submit", "--kind", kind, "--project", "web"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let lines = stdout_lines(&output.stdout);
    assert_eq!(lines[0]["status"], "pending");
    lines[0]["id"].as_str().unwrap().to_string()
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = workspace();
        runway(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("submit"))
            .stdout(predicate::str::contains("approve"));
    }

    #[test]
    fn test_init_db_creates_database() {
        let dir = workspace();
        runway(&dir)
            .arg("init-db")
            .assert()
            .success()
            .stdout(predicate::str::contains("Database initialized"));
        assert!(dir.path().join("runway.db").exists());
    }

    #[test]
    fn test_runs_on_empty_database() {
        let dir = workspace();
        runway(&dir)
            .arg("runs")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs."));
    }

    #[test]
    fn test_missing_explicit_config_fails() {
        let dir = TempDir::new().unwrap();
        cargo_bin_cmd!("runway")
            .current_dir(dir.path())
            .args(["--config", "nope.toml", "runs"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read config file"));
    }

    #[test]
    fn test_invalid_kind_is_rejected() {
        let dir = workspace();
        runway(&dir)
            .args(["submit", "--kind", "deploy", "--project", "web"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid run kind"));
    }
}

mod runs {
    use super::*;

    #[test]
    fn test_research_run_executes_end_to_end() {
        let dir = workspace();
        let output = runway(&dir)
            .args([
                "submit",
                "--kind",
                "research",
                "--project",
                "web",
                "--intent",
                "Survey the API",
                "--execute",
            ])
            .output()
            .unwrap();
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

        let lines = stdout_lines(&output.stdout);
        let run_id = lines[0]["id"].as_str().unwrap().to_string();
        let types: Vec<&str> = lines[1..]
            .iter()
            .map(|e| e["type"].as_str().unwrap())
            .collect();
        assert_eq!(types.first(), Some(&"run-started"));
        assert_eq!(types.last(), Some(&"run-finished"));
        assert_eq!(lines.last().unwrap()["status"], "succeeded");

        let summary = dir.path().join("artifacts").join(&run_id).join("summary.md");
        assert!(summary.exists());
        assert!(fs::read_to_string(summary).unwrap().contains("run.start"));

        runway(&dir)
            .args(["status", &run_id])
            .assert()
            .success()
            .stdout(predicate::str::contains("artifact.run_summary"))
            .stdout(predicate::str::contains("succeeded"));

        // A finished run executes as a no-op.
        runway(&dir).args(["execute", &run_id]).assert().success();
    }

    #[test]
    fn test_implementation_run_fails_preflight_without_token() {
        let dir = workspace();
        let run_id = submit(&dir, "implementation");

        runway(&dir)
            .args(["execute", &run_id])
            .assert()
            .failure()
            .stdout(predicate::str::contains("\"status\":\"failed\""))
            .stderr(predicate::str::contains("GITHUB_TOKEN is not configured"));

        runway(&dir)
            .args(["status", &run_id])
            .assert()
            .success()
            .stdout(predicate::str::contains("impl.preflight"))
            .stdout(predicate::str::contains("failed"));
    }

    #[test]
    fn test_cancel_pending_run() {
        let dir = workspace();
        let run_id = submit(&dir, "research");

        runway(&dir)
            .args(["cancel", &run_id])
            .assert()
            .success()
            .stdout(predicate::str::contains("status canceled"));

        runway(&dir)
            .args(["cancel", &run_id])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already canceled"));

        runway(&dir)
            .args(["execute", &run_id])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already finished as canceled"));
    }

    #[test]
    fn test_status_of_unknown_run_fails() {
        let dir = workspace();
        runway(&dir)
            .args(["status", "run_missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Run run_missing not found"));
    }
}

mod approvals {
    use super::*;

    #[test]
    fn test_no_pending_approvals() {
        let dir = workspace();
        runway(&dir)
            .arg("approvals")
            .assert()
            .success()
            .stdout(predicate::str::contains("No pending approvals."));
    }

    #[test]
    fn test_approve_unknown_approval_fails() {
        let dir = workspace();
        runway(&dir)
            .args(["approve", "apr_missing", "--by", "alice"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Approval apr_missing not found"));
    }

    #[test]
    fn test_approve_requires_a_name() {
        let dir = workspace();
        runway(&dir)
            .args(["approve", "apr_missing", "--by", "  "])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--by must not be empty"));
    }
}
