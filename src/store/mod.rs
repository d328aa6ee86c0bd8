//! Persistence contract for runs, steps and approval requests.
//!
//! Every operation is safe under at-least-once invocation: a retried call
//! after a crash either repeats an idempotent write or is a no-op. The
//! orchestrator only talks to the traits here; [`SqliteRunStore`] is the
//! shipped implementation.

pub mod db;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use runway_common::{
    ApprovalRequest, Run, RunKind, RunStep, StepErrorPayload, StepKind, StepStatus, TerminalStatus,
};
use serde_json::Value;

pub use db::{DbHandle, RunDb};
pub use sqlite::SqliteRunStore;

/// Registration data for one step of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct StepMeta {
    pub step_id: String,
    pub step_kind: StepKind,
    pub step_name: String,
    pub inputs: Option<Value>,
}

impl StepMeta {
    pub fn new(step_id: impl Into<String>, step_kind: StepKind, step_name: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            step_kind,
            step_name: step_name.into(),
            inputs: None,
        }
    }

    pub fn tool(step_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self::new(step_id, StepKind::Tool, step_name)
    }

    pub fn sandbox(step_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self::new(step_id, StepKind::Sandbox, step_name)
    }

    pub fn llm(step_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self::new(step_id, StepKind::Llm, step_name)
    }

    pub fn external_poll(step_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self::new(step_id, StepKind::ExternalPoll, step_name)
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = Some(inputs);
        self
    }
}

/// The outcome written by `finish_run_step`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFinish {
    pub status: StepStatus,
    pub outputs: Option<Value>,
    pub error: Option<StepErrorPayload>,
    /// Serialized step result for resuming without re-execution.
    pub checkpoint: Option<Value>,
}

impl StepFinish {
    pub fn succeeded(outputs: Value, checkpoint: Value) -> Self {
        Self {
            status: StepStatus::Succeeded,
            outputs: Some(outputs),
            error: None,
            checkpoint: Some(checkpoint),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            outputs: None,
            error: Some(StepErrorPayload::new(message)),
            checkpoint: None,
        }
    }

    pub fn canceled() -> Self {
        Self {
            status: StepStatus::Canceled,
            outputs: None,
            error: None,
            checkpoint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub kind: RunKind,
    pub project_id: String,
    pub intent: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewApproval {
    pub run_id: String,
    pub scope: String,
    pub intent_summary: String,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalResolution {
    Approve { by: String },
    Reject { by: String, reason: Option<String> },
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, new_run: NewRun) -> Result<Run>;

    /// Load a run; fails with `StoreError::RunNotFound` for unknown ids.
    async fn get_run_info(&self, run_id: &str) -> Result<Run>;

    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>>;

    /// Runs in `pending`, `running` or `waiting`, oldest first.
    async fn list_unfinished_runs(&self) -> Result<Vec<Run>>;

    /// Steps of a run in registration order.
    async fn list_run_steps(&self, run_id: &str) -> Result<Vec<RunStep>>;

    async fn mark_run_running(&self, run_id: &str) -> Result<()>;

    async fn mark_run_waiting(&self, run_id: &str) -> Result<()>;

    /// Write-once: a no-op when the run is already terminal.
    async fn mark_run_terminal(&self, run_id: &str, status: TerminalStatus) -> Result<()>;

    /// Insert the step row if absent and return the stored row.
    async fn ensure_run_step_row(&self, run_id: &str, meta: &StepMeta) -> Result<RunStep>;

    async fn begin_run_step(&self, run_id: &str, step_id: &str) -> Result<()>;

    async fn finish_run_step(&self, run_id: &str, step_id: &str, finish: StepFinish) -> Result<()>;

    async fn mark_run_step_status(
        &self,
        run_id: &str,
        step_id: &str,
        status: StepStatus,
        outputs: Option<Value>,
    ) -> Result<()>;

    /// Cancel the run and every unfinished step in one idempotent write.
    async fn cancel_run_and_steps(&self, run_id: &str) -> Result<()>;

    /// Record a cancel request. Returns false when the run is already terminal.
    async fn request_cancel(&self, run_id: &str) -> Result<bool>;

    async fn is_cancel_requested(&self, run_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Create the request for `(run_id, scope)` or return the existing one.
    async fn ensure_approval_request(&self, request: NewApproval) -> Result<ApprovalRequest>;

    async fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRequest>>;

    async fn list_approvals(
        &self,
        run_id: Option<&str>,
        pending_only: bool,
    ) -> Result<Vec<ApprovalRequest>>;

    /// Resolve a pending request exactly once.
    async fn resolve_approval(
        &self,
        approval_id: &str,
        resolution: ApprovalResolution,
    ) -> Result<ApprovalRequest>;
}
