use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use runway_common::{
    ApprovalRequest, ApprovalStatus, Run, RunKind, RunStatus, RunStep, StepErrorPayload, StepKind,
    StepStatus, TerminalStatus, new_id,
};
use serde_json::Value;

use super::{ApprovalResolution, NewApproval, NewRun, StepFinish, StepMeta};
use crate::errors::StoreError;

/// Async-safe handle to the run database.
///
/// Wraps `RunDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RunDb>>,
}

impl DbHandle {
    pub fn new(db: RunDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RunDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

const TERMINAL_SQL: &str = "('succeeded', 'failed', 'canceled')";

const RUN_COLUMNS: &str = "id, kind, project_id, intent, status, workflow_run_id, active_step_id, \
     cancel_requested_at, created_at, updated_at, finished_at";

const STEP_COLUMNS: &str = "run_id, step_id, step_kind, step_name, status, position, attempts, \
     inputs, outputs, error, checkpoint, started_at, finished_at";

const APPROVAL_COLUMNS: &str = "approval_id, run_id, scope, intent_summary, metadata, status, \
     approved_by, approved_at, reason, created_at";

pub struct RunDb {
    conn: Connection,
}

impl RunDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    project_id TEXT NOT NULL,
                    intent TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    workflow_run_id TEXT NOT NULL,
                    active_step_id TEXT,
                    cancel_requested_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS run_steps (
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    step_id TEXT NOT NULL,
                    step_kind TEXT NOT NULL,
                    step_name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    position INTEGER NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    inputs TEXT,
                    outputs TEXT,
                    error TEXT,
                    checkpoint TEXT,
                    started_at TEXT,
                    finished_at TEXT,
                    PRIMARY KEY (run_id, step_id)
                );

                CREATE TABLE IF NOT EXISTS approval_requests (
                    approval_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    scope TEXT NOT NULL,
                    intent_summary TEXT NOT NULL,
                    metadata TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    approved_by TEXT,
                    approved_at TEXT,
                    reason TEXT,
                    created_at TEXT NOT NULL,
                    UNIQUE(run_id, scope)
                );

                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_run_steps_run ON run_steps(run_id, position);
                CREATE INDEX IF NOT EXISTS idx_approvals_run ON approval_requests(run_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Runs ────────────────────────────────────────────────────────────

    pub fn create_run(&self, new_run: &NewRun) -> Result<Run> {
        let id = new_id("run");
        let workflow_run_id = new_id("wf");
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO runs (id, kind, project_id, intent, status, workflow_run_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
                params![
                    id,
                    new_run.kind.as_str(),
                    new_run.project_id,
                    new_run.intent,
                    workflow_run_id,
                    now
                ],
            )
            .context("Failed to insert run")?;
        self.require_run(&id)
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], RunRow::from_row)
            .optional()
            .context("Failed to query run")?;
        row.map(RunRow::into_run).transpose()
    }

    pub fn require_run(&self, id: &str) -> Result<Run> {
        self.get_run(id)?.ok_or_else(|| {
            StoreError::RunNotFound {
                id: id.to_string(),
            }
            .into()
        })
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {} FROM runs ORDER BY created_at DESC, id LIMIT ?1",
            RUN_COLUMNS
        );
        self.query_runs(&sql, params![limit as i64])
    }

    pub fn list_unfinished_runs(&self) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {} FROM runs WHERE status IN ('pending', 'running', 'waiting') ORDER BY created_at, id",
            RUN_COLUMNS
        );
        self.query_runs(&sql, params![])
    }

    fn query_runs(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare runs query")?;
        let rows = stmt
            .query_map(args, RunRow::from_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok(runs)
    }

    /// Move a non-terminal run to `running` or `waiting`. No-op on terminal runs.
    pub fn set_run_status(&self, id: &str, status: RunStatus) -> Result<()> {
        let sql = format!(
            "UPDATE runs SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status NOT IN {}",
            TERMINAL_SQL
        );
        let changed = self
            .conn
            .execute(&sql, params![id, status.as_str(), Utc::now()])
            .context("Failed to update run status")?;
        if changed == 0 {
            self.require_run(id)?;
        }
        Ok(())
    }

    /// Write-once terminal transition. Approvals still pending for the run
    /// are canceled with it.
    pub fn mark_run_terminal(&self, id: &str, status: TerminalStatus) -> Result<()> {
        let now = Utc::now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let sql = format!(
            "UPDATE runs SET status = ?2, updated_at = ?3, finished_at = ?3, active_step_id = NULL
             WHERE id = ?1 AND status NOT IN {}",
            TERMINAL_SQL
        );
        let changed = tx
            .execute(&sql, params![id, status.as_str(), now])
            .context("Failed to mark run terminal")?;
        if changed == 0 {
            drop(tx);
            self.require_run(id)?;
            return Ok(());
        }
        tx.execute(
            "UPDATE approval_requests SET status = 'canceled', approved_at = ?2
             WHERE run_id = ?1 AND status = 'pending'",
            params![id, now],
        )
        .context("Failed to cancel pending approvals")?;
        tx.commit().context("Failed to commit terminal status")?;
        Ok(())
    }

    pub fn cancel_run_and_steps(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM runs WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to check run")?;
        if !exists {
            return Err(StoreError::RunNotFound { id: id.to_string() }.into());
        }
        tx.execute(
            &format!(
                "UPDATE runs SET status = 'canceled', updated_at = ?2, finished_at = ?2, active_step_id = NULL
                 WHERE id = ?1 AND status NOT IN {}",
                TERMINAL_SQL
            ),
            params![id, now],
        )
        .context("Failed to cancel run")?;
        tx.execute(
            "UPDATE run_steps SET status = 'canceled', finished_at = ?2
             WHERE run_id = ?1 AND status IN ('pending', 'running', 'waiting')",
            params![id, now],
        )
        .context("Failed to cancel run steps")?;
        tx.execute(
            "UPDATE approval_requests SET status = 'canceled', approved_at = ?2
             WHERE run_id = ?1 AND status = 'pending'",
            params![id, now],
        )
        .context("Failed to cancel pending approvals")?;
        tx.commit().context("Failed to commit cancellation")?;
        Ok(())
    }

    pub fn request_cancel(&self, id: &str) -> Result<bool> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE runs SET cancel_requested_at = COALESCE(cancel_requested_at, ?2), updated_at = ?2
             WHERE id = ?1 AND status NOT IN {}",
            TERMINAL_SQL
        );
        let changed = self
            .conn
            .execute(&sql, params![id, now])
            .context("Failed to record cancel request")?;
        if changed == 0 {
            self.require_run(id)?;
            return Ok(false);
        }
        Ok(true)
    }

    pub fn is_cancel_requested(&self, id: &str) -> Result<bool> {
        let requested: Option<bool> = self
            .conn
            .query_row(
                "SELECT cancel_requested_at IS NOT NULL FROM runs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query cancel request")?;
        requested.ok_or_else(|| StoreError::RunNotFound { id: id.to_string() }.into())
    }

    // ── Steps ───────────────────────────────────────────────────────────

    /// Insert-if-absent. A repeated call leaves the existing row untouched.
    pub fn ensure_run_step(&self, run_id: &str, meta: &StepMeta) -> Result<RunStep> {
        let inputs = json_text(meta.inputs.as_ref())?;
        self.conn
            .execute(
                "INSERT INTO run_steps (run_id, step_id, step_kind, step_name, status, position, inputs)
                 VALUES (?1, ?2, ?3, ?4, 'pending',
                         (SELECT COALESCE(MAX(position), -1) + 1 FROM run_steps WHERE run_id = ?1), ?5)
                 ON CONFLICT(run_id, step_id) DO NOTHING",
                params![
                    run_id,
                    meta.step_id,
                    meta.step_kind.as_str(),
                    meta.step_name,
                    inputs
                ],
            )
            .context("Failed to insert run step")?;
        self.require_step(run_id, &meta.step_id)
    }

    pub fn get_step(&self, run_id: &str, step_id: &str) -> Result<Option<RunStep>> {
        let sql = format!(
            "SELECT {} FROM run_steps WHERE run_id = ?1 AND step_id = ?2",
            STEP_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![run_id, step_id], StepRow::from_row)
            .optional()
            .context("Failed to query run step")?;
        row.map(StepRow::into_step).transpose()
    }

    fn require_step(&self, run_id: &str, step_id: &str) -> Result<RunStep> {
        self.get_step(run_id, step_id)?.ok_or_else(|| {
            StoreError::StepNotFound {
                run_id: run_id.to_string(),
                step_id: step_id.to_string(),
            }
            .into()
        })
    }

    pub fn list_steps(&self, run_id: &str) -> Result<Vec<RunStep>> {
        let sql = format!(
            "SELECT {} FROM run_steps WHERE run_id = ?1 ORDER BY position",
            STEP_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_steps")?;
        let rows = stmt
            .query_map(params![run_id], StepRow::from_row)
            .context("Failed to query run steps")?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.context("Failed to read run step row")?.into_step()?);
        }
        Ok(steps)
    }

    /// Mark a step running and make it the run's active step.
    ///
    /// Fails with `ActiveStepConflict` while a different step is running or
    /// waiting. Every begin counts as an attempt, including re-beginning a
    /// step left `running` by a process that died mid-step.
    pub fn begin_step(&self, run_id: &str, step_id: &str) -> Result<()> {
        let now = Utc::now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let active: Option<String> = tx
            .query_row(
                "SELECT step_id FROM run_steps
                 WHERE run_id = ?1 AND step_id != ?2 AND status IN ('running', 'waiting')
                 LIMIT 1",
                params![run_id, step_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check active step")?;
        if let Some(active) = active {
            return Err(StoreError::ActiveStepConflict {
                run_id: run_id.to_string(),
                active,
                requested: step_id.to_string(),
            }
            .into());
        }

        let changed = tx
            .execute(
                "UPDATE run_steps SET
                    attempts = attempts + 1,
                    started_at = ?3,
                    status = 'running',
                    finished_at = NULL,
                    error = NULL
                 WHERE run_id = ?1 AND step_id = ?2",
                params![run_id, step_id, now],
            )
            .context("Failed to begin run step")?;
        if changed == 0 {
            return Err(StoreError::StepNotFound {
                run_id: run_id.to_string(),
                step_id: step_id.to_string(),
            }
            .into());
        }
        tx.execute(
            "UPDATE runs SET active_step_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![run_id, step_id, now],
        )
        .context("Failed to set active step")?;
        tx.commit().context("Failed to commit step begin")?;
        Ok(())
    }

    pub fn finish_step(&self, run_id: &str, step_id: &str, finish: &StepFinish) -> Result<()> {
        let now = Utc::now();
        let outputs = json_text(finish.outputs.as_ref())?;
        let checkpoint = json_text(finish.checkpoint.as_ref())?;
        let error = finish
            .error
            .as_ref()
            .map(|e| e.message.clone());

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let changed = tx
            .execute(
                "UPDATE run_steps SET status = ?3, outputs = ?4, error = ?5, checkpoint = ?6, finished_at = ?7
                 WHERE run_id = ?1 AND step_id = ?2",
                params![
                    run_id,
                    step_id,
                    finish.status.as_str(),
                    outputs,
                    error,
                    checkpoint,
                    now
                ],
            )
            .context("Failed to finish run step")?;
        if changed == 0 {
            return Err(StoreError::StepNotFound {
                run_id: run_id.to_string(),
                step_id: step_id.to_string(),
            }
            .into());
        }
        tx.execute(
            "UPDATE runs SET active_step_id = NULL, updated_at = ?3
             WHERE id = ?1 AND active_step_id = ?2",
            params![run_id, step_id, now],
        )
        .context("Failed to clear active step")?;
        tx.commit().context("Failed to commit step finish")?;
        Ok(())
    }

    /// Set a step's status without finishing it (e.g. `waiting` at a gate).
    /// Existing outputs are kept when `outputs` is `None`.
    pub fn set_step_status(
        &self,
        run_id: &str,
        step_id: &str,
        status: StepStatus,
        outputs: Option<&Value>,
    ) -> Result<()> {
        let outputs = json_text(outputs)?;
        let changed = self
            .conn
            .execute(
                "UPDATE run_steps SET status = ?3, outputs = COALESCE(?4, outputs)
                 WHERE run_id = ?1 AND step_id = ?2",
                params![run_id, step_id, status.as_str(), outputs],
            )
            .context("Failed to update run step status")?;
        if changed == 0 {
            return Err(StoreError::StepNotFound {
                run_id: run_id.to_string(),
                step_id: step_id.to_string(),
            }
            .into());
        }
        Ok(())
    }

    // ── Approvals ───────────────────────────────────────────────────────

    pub fn ensure_approval(&self, request: &NewApproval) -> Result<ApprovalRequest> {
        let metadata = json_text(request.metadata.as_ref())?;
        self.conn
            .execute(
                "INSERT INTO approval_requests (approval_id, run_id, scope, intent_summary, metadata, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
                 ON CONFLICT(run_id, scope) DO NOTHING",
                params![
                    new_id("apr"),
                    request.run_id,
                    request.scope,
                    request.intent_summary,
                    metadata,
                    Utc::now()
                ],
            )
            .context("Failed to insert approval request")?;

        let sql = format!(
            "SELECT {} FROM approval_requests WHERE run_id = ?1 AND scope = ?2",
            APPROVAL_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![request.run_id, request.scope], ApprovalRow::from_row)
            .context("Failed to read approval request")?;
        row.into_approval()
    }

    pub fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRequest>> {
        let sql = format!(
            "SELECT {} FROM approval_requests WHERE approval_id = ?1",
            APPROVAL_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![approval_id], ApprovalRow::from_row)
            .optional()
            .context("Failed to query approval request")?;
        row.map(ApprovalRow::into_approval).transpose()
    }

    pub fn list_approvals(
        &self,
        run_id: Option<&str>,
        pending_only: bool,
    ) -> Result<Vec<ApprovalRequest>> {
        let sql = format!(
            "SELECT {} FROM approval_requests
             WHERE (?1 IS NULL OR run_id = ?1) AND (?2 = 0 OR status = 'pending')
             ORDER BY created_at, approval_id",
            APPROVAL_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_approvals")?;
        let rows = stmt
            .query_map(params![run_id, pending_only], ApprovalRow::from_row)
            .context("Failed to query approval requests")?;
        let mut approvals = Vec::new();
        for row in rows {
            approvals.push(row.context("Failed to read approval row")?.into_approval()?);
        }
        Ok(approvals)
    }

    /// Resolve a pending approval. Only the first resolution wins.
    pub fn resolve_approval(
        &self,
        approval_id: &str,
        resolution: &ApprovalResolution,
    ) -> Result<ApprovalRequest> {
        let (status, by, reason) = match resolution {
            ApprovalResolution::Approve { by } => (ApprovalStatus::Approved, by, None),
            ApprovalResolution::Reject { by, reason } => {
                (ApprovalStatus::Rejected, by, reason.as_deref())
            }
        };
        let changed = self
            .conn
            .execute(
                "UPDATE approval_requests SET status = ?2, approved_by = ?3, approved_at = ?4, reason = ?5
                 WHERE approval_id = ?1 AND status = 'pending'",
                params![approval_id, status.as_str(), by, Utc::now(), reason],
            )
            .context("Failed to resolve approval request")?;

        let current = self.get_approval(approval_id)?;
        match current {
            None => Err(StoreError::ApprovalNotFound {
                id: approval_id.to_string(),
            }
            .into()),
            Some(existing) if changed == 0 => Err(StoreError::ApprovalAlreadyResolved {
                id: approval_id.to_string(),
                status: existing.status.to_string(),
            }
            .into()),
            Some(resolved) => Ok(resolved),
        }
    }
}

fn json_text(value: Option<&Value>) -> Result<Option<String>> {
    value
        .map(|v| serde_json::to_string(v).context("Failed to serialize JSON column"))
        .transpose()
}

fn parse_json_text(text: Option<String>) -> Result<Option<Value>> {
    text.map(|t| serde_json::from_str(&t).context("Failed to parse JSON column"))
        .transpose()
}

fn parse_enum<T: FromStr<Err = String>>(value: &str, what: &str) -> Result<T> {
    T::from_str(value)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}

/// Intermediate row struct for runs.
struct RunRow {
    id: String,
    kind: String,
    project_id: String,
    intent: String,
    status: String,
    workflow_run_id: String,
    active_step_id: Option<String>,
    cancel_requested_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            project_id: row.get(2)?,
            intent: row.get(3)?,
            status: row.get(4)?,
            workflow_run_id: row.get(5)?,
            active_step_id: row.get(6)?,
            cancel_requested_at: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            finished_at: row.get(10)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        Ok(Run {
            kind: parse_enum::<RunKind>(&self.kind, "run kind")?,
            status: parse_enum::<RunStatus>(&self.status, "run status")?,
            id: self.id,
            project_id: self.project_id,
            intent: self.intent,
            workflow_run_id: self.workflow_run_id,
            active_step_id: self.active_step_id,
            cancel_requested_at: self.cancel_requested_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }
}

/// Intermediate row struct for run_steps.
struct StepRow {
    run_id: String,
    step_id: String,
    step_kind: String,
    step_name: String,
    status: String,
    position: i64,
    attempts: i64,
    inputs: Option<String>,
    outputs: Option<String>,
    error: Option<String>,
    checkpoint: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl StepRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            step_id: row.get(1)?,
            step_kind: row.get(2)?,
            step_name: row.get(3)?,
            status: row.get(4)?,
            position: row.get(5)?,
            attempts: row.get(6)?,
            inputs: row.get(7)?,
            outputs: row.get(8)?,
            error: row.get(9)?,
            checkpoint: row.get(10)?,
            started_at: row.get(11)?,
            finished_at: row.get(12)?,
        })
    }

    fn into_step(self) -> Result<RunStep> {
        Ok(RunStep {
            step_kind: parse_enum::<StepKind>(&self.step_kind, "step kind")?,
            status: parse_enum::<StepStatus>(&self.status, "step status")?,
            inputs: parse_json_text(self.inputs)?,
            outputs: parse_json_text(self.outputs)?,
            checkpoint: parse_json_text(self.checkpoint)?,
            error: self.error.map(StepErrorPayload::new),
            run_id: self.run_id,
            step_id: self.step_id,
            step_name: self.step_name,
            position: self.position,
            attempts: self.attempts,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

/// Intermediate row struct for approval_requests.
struct ApprovalRow {
    approval_id: String,
    run_id: String,
    scope: String,
    intent_summary: String,
    metadata: Option<String>,
    status: String,
    approved_by: Option<String>,
    approved_at: Option<DateTime<Utc>>,
    reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl ApprovalRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            approval_id: row.get(0)?,
            run_id: row.get(1)?,
            scope: row.get(2)?,
            intent_summary: row.get(3)?,
            metadata: row.get(4)?,
            status: row.get(5)?,
            approved_by: row.get(6)?,
            approved_at: row.get(7)?,
            reason: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_approval(self) -> Result<ApprovalRequest> {
        Ok(ApprovalRequest {
            status: parse_enum::<ApprovalStatus>(&self.status, "approval status")?,
            metadata: parse_json_text(self.metadata)?,
            approval_id: self.approval_id,
            run_id: self.run_id,
            scope: self.scope,
            intent_summary: self.intent_summary,
            approved_by: self.approved_by,
            approved_at: self.approved_at,
            reason: self.reason,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db_with_run(kind: RunKind) -> Result<(RunDb, Run)> {
        let db = RunDb::new_in_memory()?;
        let run = db.create_run(&NewRun {
            kind,
            project_id: "proj_1".into(),
            intent: "add a health endpoint".into(),
        })?;
        Ok((db, run))
    }

    #[test]
    fn test_create_and_get_run() -> Result<()> {
        let (db, run) = db_with_run(RunKind::Implementation)?;
        assert!(run.id.starts_with("run_"));
        assert!(run.workflow_run_id.starts_with("wf_"));
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.intent, "add a health endpoint");

        let loaded = db.get_run(&run.id)?.unwrap();
        assert_eq!(loaded, run);
        assert!(db.get_run("run_missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_require_run_missing_is_typed() {
        let db = RunDb::new_in_memory().unwrap();
        let err = db.require_run("run_missing").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::RunNotFound { .. })
        ));
    }

    #[test]
    fn test_ensure_run_step_is_idempotent() -> Result<()> {
        let (db, run) = db_with_run(RunKind::Research)?;
        let meta = StepMeta::tool("run.start", "Start run").with_inputs(json!({"a": 1}));

        let first = db.ensure_run_step(&run.id, &meta)?;
        db.begin_step(&run.id, "run.start")?;
        let second = db.ensure_run_step(&run.id, &meta)?;

        assert_eq!(db.list_steps(&run.id)?.len(), 1);
        assert_eq!(first.status, StepStatus::Pending);
        // The repeat registration does not reset the in-flight state.
        assert_eq!(second.status, StepStatus::Running);
        assert_eq!(second.position, first.position);
        assert_eq!(second.inputs, Some(json!({"a": 1})));
        Ok(())
    }

    #[test]
    fn test_steps_are_listed_in_registration_order() -> Result<()> {
        let (db, run) = db_with_run(RunKind::Research)?;
        for id in ["run.start", "run.complete", "artifact.run_summary"] {
            db.ensure_run_step(&run.id, &StepMeta::tool(id, id))?;
        }
        let ids: Vec<String> = db
            .list_steps(&run.id)?
            .into_iter()
            .map(|s| s.step_id)
            .collect();
        assert_eq!(ids, vec!["run.start", "run.complete", "artifact.run_summary"]);
        Ok(())
    }

    #[test]
    fn test_begin_and_finish_step_track_active_step() -> Result<()> {
        let (db, run) = db_with_run(RunKind::Research)?;
        db.ensure_run_step(&run.id, &StepMeta::tool("run.start", "Start"))?;
        db.begin_step(&run.id, "run.start")?;

        let step = db.get_step(&run.id, "run.start")?.unwrap();
        assert_eq!(step.status, StepStatus::Running);
        assert_eq!(step.attempts, 1);
        assert!(step.started_at.is_some());
        assert_eq!(
            db.require_run(&run.id)?.active_step_id.as_deref(),
            Some("run.start")
        );

        db.finish_step(
            &run.id,
            "run.start",
            &StepFinish::succeeded(json!({"ok": true}), json!({"ok": true})),
        )?;
        let step = db.get_step(&run.id, "run.start")?.unwrap();
        assert_eq!(step.status, StepStatus::Succeeded);
        assert_eq!(step.outputs, Some(json!({"ok": true})));
        assert_eq!(step.checkpoint, Some(json!({"ok": true})));
        assert!(step.finished_at.is_some());
        assert!(db.require_run(&run.id)?.active_step_id.is_none());
        Ok(())
    }

    #[test]
    fn test_rebegin_after_crash_counts_attempt() -> Result<()> {
        let (db, run) = db_with_run(RunKind::Implementation)?;
        let meta = StepMeta::new("impl.plan", StepKind::Llm, "Plan");
        db.ensure_run_step(&run.id, &meta)?;
        db.begin_step(&run.id, "impl.plan")?;
        let first = db.get_step(&run.id, "impl.plan")?.unwrap();

        // A restarted process finds the row still running and begins it again.
        db.ensure_run_step(&run.id, &meta)?;
        db.begin_step(&run.id, "impl.plan")?;

        let step = db.get_step(&run.id, "impl.plan")?.unwrap();
        assert_eq!(step.status, StepStatus::Running);
        assert_eq!(step.attempts, 2);
        assert!(step.started_at >= first.started_at);
        Ok(())
    }

    #[test]
    fn test_second_active_step_is_rejected() -> Result<()> {
        let (db, run) = db_with_run(RunKind::Implementation)?;
        db.ensure_run_step(&run.id, &StepMeta::tool("impl.preflight", "Preflight"))?;
        db.ensure_run_step(&run.id, &StepMeta::tool("impl.repo.ensure", "Repo"))?;
        db.begin_step(&run.id, "impl.preflight")?;

        let err = db.begin_step(&run.id, "impl.repo.ensure").unwrap_err();
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::ActiveStepConflict { active, requested, .. }) => {
                assert_eq!(active, "impl.preflight");
                assert_eq!(requested, "impl.repo.ensure");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(
            db.get_step(&run.id, "impl.repo.ensure")?.unwrap().status,
            StepStatus::Pending
        );
        Ok(())
    }

    #[test]
    fn test_failed_step_keeps_message_only() -> Result<()> {
        let (db, run) = db_with_run(RunKind::Research)?;
        db.ensure_run_step(&run.id, &StepMeta::tool("artifact.run_summary", "Summary"))?;
        db.begin_step(&run.id, "artifact.run_summary")?;
        db.finish_step(
            &run.id,
            "artifact.run_summary",
            &StepFinish::failed("artifact explode"),
        )?;
        let step = db.get_step(&run.id, "artifact.run_summary")?.unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error, Some(StepErrorPayload::new("artifact explode")));
        Ok(())
    }

    #[test]
    fn test_finish_unknown_step_fails() -> Result<()> {
        let (db, run) = db_with_run(RunKind::Research)?;
        let err = db
            .finish_step(&run.id, "nope", &StepFinish::canceled())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::StepNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_terminal_status_is_write_once() -> Result<()> {
        let (db, run) = db_with_run(RunKind::Research)?;
        db.set_run_status(&run.id, RunStatus::Running)?;
        db.mark_run_terminal(&run.id, TerminalStatus::Failed)?;
        db.mark_run_terminal(&run.id, TerminalStatus::Succeeded)?;
        db.set_run_status(&run.id, RunStatus::Running)?;
        db.cancel_run_and_steps(&run.id)?;

        let loaded = db.require_run(&run.id)?;
        assert_eq!(loaded.status, RunStatus::Failed);
        assert!(loaded.finished_at.is_some());
        Ok(())
    }

    #[test]
    fn test_mark_terminal_unknown_run_fails() {
        let db = RunDb::new_in_memory().unwrap();
        assert!(db
            .mark_run_terminal("run_missing", TerminalStatus::Failed)
            .is_err());
    }

    #[test]
    fn test_cancel_run_and_steps_is_idempotent() -> Result<()> {
        let (db, run) = db_with_run(RunKind::Implementation)?;
        db.ensure_run_step(&run.id, &StepMeta::tool("impl.preflight", "Preflight"))?;
        db.begin_step(&run.id, "impl.preflight")?;
        db.finish_step(
            &run.id,
            "impl.preflight",
            &StepFinish::succeeded(json!({}), json!({})),
        )?;
        db.ensure_run_step(
            &run.id,
            &StepMeta::new("approval.merge", StepKind::Approval, "Merge approval"),
        )?;
        db.begin_step(&run.id, "approval.merge")?;
        db.set_step_status(&run.id, "approval.merge", StepStatus::Waiting, None)?;
        let approval = db.ensure_approval(&NewApproval {
            run_id: run.id.clone(),
            scope: "merge".into(),
            intent_summary: "Merge".into(),
            metadata: None,
        })?;

        db.cancel_run_and_steps(&run.id)?;
        db.cancel_run_and_steps(&run.id)?;

        let loaded = db.require_run(&run.id)?;
        assert_eq!(loaded.status, RunStatus::Canceled);
        assert!(loaded.active_step_id.is_none());
        let steps = db.list_steps(&run.id)?;
        assert_eq!(steps[0].status, StepStatus::Succeeded);
        assert_eq!(steps[1].status, StepStatus::Canceled);
        let approval = db.get_approval(&approval.approval_id)?.unwrap();
        assert_eq!(approval.status, ApprovalStatus::Canceled);
        Ok(())
    }

    #[test]
    fn test_request_cancel() -> Result<()> {
        let (db, run) = db_with_run(RunKind::Research)?;
        assert!(!db.is_cancel_requested(&run.id)?);
        assert!(db.request_cancel(&run.id)?);
        let first = db.require_run(&run.id)?.cancel_requested_at;
        assert!(db.request_cancel(&run.id)?);
        assert_eq!(db.require_run(&run.id)?.cancel_requested_at, first);
        assert!(db.is_cancel_requested(&run.id)?);

        db.mark_run_terminal(&run.id, TerminalStatus::Canceled)?;
        assert!(!db.request_cancel(&run.id)?);
        assert!(db.request_cancel("run_missing").is_err());
        assert!(db.is_cancel_requested("run_missing").is_err());
        Ok(())
    }

    #[test]
    fn test_unfinished_runs_exclude_terminal() -> Result<()> {
        let db = RunDb::new_in_memory()?;
        let new_run = NewRun {
            kind: RunKind::Research,
            project_id: "p".into(),
            intent: String::new(),
        };
        let a = db.create_run(&new_run)?;
        let b = db.create_run(&new_run)?;
        let c = db.create_run(&new_run)?;
        db.set_run_status(&b.id, RunStatus::Waiting)?;
        db.mark_run_terminal(&c.id, TerminalStatus::Succeeded)?;

        let ids: Vec<String> = db
            .list_unfinished_runs()?
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&b.id));
        assert_eq!(db.list_runs(10)?.len(), 3);
        assert_eq!(db.list_runs(1)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_ensure_approval_is_idempotent_per_scope() -> Result<()> {
        let (db, run) = db_with_run(RunKind::Implementation)?;
        let request = NewApproval {
            run_id: run.id.clone(),
            scope: "merge".into(),
            intent_summary: "Merge PR #7".into(),
            metadata: Some(json!({"pr": 7})),
        };
        let first = db.ensure_approval(&request)?;
        let second = db.ensure_approval(&NewApproval {
            intent_summary: "something else".into(),
            ..request.clone()
        })?;
        assert_eq!(first.approval_id, second.approval_id);
        assert_eq!(second.intent_summary, "Merge PR #7");
        assert_eq!(second.metadata, Some(json!({"pr": 7})));

        let other = db.ensure_approval(&NewApproval {
            scope: "provision".into(),
            ..request
        })?;
        assert_ne!(other.approval_id, first.approval_id);
        assert_eq!(db.list_approvals(Some(&run.id), true)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_resolve_approval_exactly_once() -> Result<()> {
        let (db, run) = db_with_run(RunKind::Implementation)?;
        let approval = db.ensure_approval(&NewApproval {
            run_id: run.id.clone(),
            scope: "merge".into(),
            intent_summary: "Merge".into(),
            metadata: None,
        })?;

        let resolved = db.resolve_approval(
            &approval.approval_id,
            &ApprovalResolution::Approve { by: "alice".into() },
        )?;
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.approved_by.as_deref(), Some("alice"));
        assert!(resolved.approved_at.is_some());

        let err = db
            .resolve_approval(
                &approval.approval_id,
                &ApprovalResolution::Reject {
                    by: "bob".into(),
                    reason: None,
                },
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ApprovalAlreadyResolved { .. })
        ));
        let current = db.get_approval(&approval.approval_id)?.unwrap();
        assert_eq!(current.approved_by.as_deref(), Some("alice"));

        let err = db
            .resolve_approval("apr_missing", &ApprovalResolution::Approve { by: "x".into() })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ApprovalNotFound { .. })
        ));
        assert!(db.list_approvals(None, true)?.is_empty());
        assert_eq!(db.list_approvals(None, false)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_failed_run_closes_pending_approvals() -> Result<()> {
        let (db, run) = db_with_run(RunKind::Implementation)?;
        let approval = db.ensure_approval(&NewApproval {
            run_id: run.id.clone(),
            scope: "merge".into(),
            intent_summary: "Merge".into(),
            metadata: None,
        })?;

        db.mark_run_terminal(&run.id, TerminalStatus::Failed)?;

        let closed = db.get_approval(&approval.approval_id)?.unwrap();
        assert_eq!(closed.status, ApprovalStatus::Canceled);
        assert!(db.list_approvals(Some(&run.id), true)?.is_empty());
        let err = db
            .resolve_approval(
                &approval.approval_id,
                &ApprovalResolution::Approve { by: "alice".into() },
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ApprovalAlreadyResolved { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_reopening_file_database_keeps_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("runway.db");
        let run_id = {
            let db = RunDb::new(&path)?;
            db.create_run(&NewRun {
                kind: RunKind::Research,
                project_id: "p".into(),
                intent: String::new(),
            })?
            .id
        };
        let db = RunDb::new(&path)?;
        assert!(db.get_run(&run_id)?.is_some());
        Ok(())
    }
}
