use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use runway_common::{ApprovalRequest, Run, RunStatus, RunStep, StepStatus, TerminalStatus};
use serde_json::Value;

use super::{
    ApprovalResolution, ApprovalStore, DbHandle, NewApproval, NewRun, RunDb, RunStore, StepFinish,
    StepMeta,
};

/// [`RunStore`] and [`ApprovalStore`] over a single SQLite database.
#[derive(Clone)]
pub struct SqliteRunStore {
    db: DbHandle,
}

impl SqliteRunStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Open the database file, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        let db = RunDb::new(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Ok(Self::new(DbHandle::new(db)))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(DbHandle::new(RunDb::new_in_memory()?)))
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create_run(&self, new_run: NewRun) -> Result<Run> {
        self.db.call(move |db| db.create_run(&new_run)).await
    }

    async fn get_run_info(&self, run_id: &str) -> Result<Run> {
        let run_id = run_id.to_string();
        self.db.call(move |db| db.require_run(&run_id)).await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        self.db.call(move |db| db.list_runs(limit)).await
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<Run>> {
        self.db.call(|db| db.list_unfinished_runs()).await
    }

    async fn list_run_steps(&self, run_id: &str) -> Result<Vec<RunStep>> {
        let run_id = run_id.to_string();
        self.db.call(move |db| db.list_steps(&run_id)).await
    }

    async fn mark_run_running(&self, run_id: &str) -> Result<()> {
        let run_id = run_id.to_string();
        self.db
            .call(move |db| db.set_run_status(&run_id, RunStatus::Running))
            .await
    }

    async fn mark_run_waiting(&self, run_id: &str) -> Result<()> {
        let run_id = run_id.to_string();
        self.db
            .call(move |db| db.set_run_status(&run_id, RunStatus::Waiting))
            .await
    }

    async fn mark_run_terminal(&self, run_id: &str, status: TerminalStatus) -> Result<()> {
        let run_id = run_id.to_string();
        self.db
            .call(move |db| db.mark_run_terminal(&run_id, status))
            .await
    }

    async fn ensure_run_step_row(&self, run_id: &str, meta: &StepMeta) -> Result<RunStep> {
        let run_id = run_id.to_string();
        let meta = meta.clone();
        self.db
            .call(move |db| db.ensure_run_step(&run_id, &meta))
            .await
    }

    async fn begin_run_step(&self, run_id: &str, step_id: &str) -> Result<()> {
        let run_id = run_id.to_string();
        let step_id = step_id.to_string();
        self.db
            .call(move |db| db.begin_step(&run_id, &step_id))
            .await
    }

    async fn finish_run_step(&self, run_id: &str, step_id: &str, finish: StepFinish) -> Result<()> {
        let run_id = run_id.to_string();
        let step_id = step_id.to_string();
        self.db
            .call(move |db| db.finish_step(&run_id, &step_id, &finish))
            .await
    }

    async fn mark_run_step_status(
        &self,
        run_id: &str,
        step_id: &str,
        status: StepStatus,
        outputs: Option<Value>,
    ) -> Result<()> {
        let run_id = run_id.to_string();
        let step_id = step_id.to_string();
        self.db
            .call(move |db| db.set_step_status(&run_id, &step_id, status, outputs.as_ref()))
            .await
    }

    async fn cancel_run_and_steps(&self, run_id: &str) -> Result<()> {
        let run_id = run_id.to_string();
        self.db
            .call(move |db| db.cancel_run_and_steps(&run_id))
            .await
    }

    async fn request_cancel(&self, run_id: &str) -> Result<bool> {
        let run_id = run_id.to_string();
        self.db.call(move |db| db.request_cancel(&run_id)).await
    }

    async fn is_cancel_requested(&self, run_id: &str) -> Result<bool> {
        let run_id = run_id.to_string();
        self.db
            .call(move |db| db.is_cancel_requested(&run_id))
            .await
    }
}

#[async_trait]
impl ApprovalStore for SqliteRunStore {
    async fn ensure_approval_request(&self, request: NewApproval) -> Result<ApprovalRequest> {
        self.db.call(move |db| db.ensure_approval(&request)).await
    }

    async fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRequest>> {
        let approval_id = approval_id.to_string();
        self.db.call(move |db| db.get_approval(&approval_id)).await
    }

    async fn list_approvals(
        &self,
        run_id: Option<&str>,
        pending_only: bool,
    ) -> Result<Vec<ApprovalRequest>> {
        let run_id = run_id.map(str::to_string);
        self.db
            .call(move |db| db.list_approvals(run_id.as_deref(), pending_only))
            .await
    }

    async fn resolve_approval(
        &self,
        approval_id: &str,
        resolution: ApprovalResolution,
    ) -> Result<ApprovalRequest> {
        let approval_id = approval_id.to_string();
        self.db
            .call(move |db| db.resolve_approval(&approval_id, &resolution))
            .await
    }
}
