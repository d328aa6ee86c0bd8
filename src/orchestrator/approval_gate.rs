use anyhow::{Context, Result};
use runway_common::{ApprovalDecision, RunStreamEvent, StepKind, StepStatus};
use serde_json::{Value, json};
use tracing::info;

use super::context::RunContext;
use super::step_runner::replay;
use crate::store::{NewApproval, StepFinish, StepMeta};

/// What a gate asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalMeta {
    pub step_id: String,
    pub scope: String,
    pub intent_summary: String,
    pub metadata: Option<Value>,
}

impl ApprovalMeta {
    pub fn new(
        step_id: impl Into<String>,
        scope: impl Into<String>,
        intent_summary: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            scope: scope.into(),
            intent_summary: intent_summary.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn step_meta(&self) -> StepMeta {
        StepMeta::new(
            self.step_id.clone(),
            StepKind::Approval,
            format!("Await {} approval", self.scope),
        )
        .with_inputs(json!({
            "scope": self.scope,
            "intentSummary": self.intent_summary,
        }))
    }
}

impl RunContext {
    /// Park the run on an approval gate until a decision arrives.
    ///
    /// The gate's progress is entirely durable: re-entering it after a
    /// restart finds the same approval request, and a gate that already
    /// succeeded replays its decision without waiting.
    pub async fn await_approval(&mut self, meta: ApprovalMeta) -> Result<ApprovalDecision> {
        self.check_canceled()?;

        let run_id = self.run_id().to_string();
        let step = meta.step_meta();
        let row = self.store().ensure_run_step_row(&run_id, &step).await?;
        if row.status == StepStatus::Succeeded {
            return replay(&row);
        }

        self.begin_step(&step.step_id).await?;
        self.emit(RunStreamEvent::step_started(
            &run_id,
            &step.step_id,
            step.step_kind,
            &step.step_name,
        ))
        .await;

        let request = self
            .approvals()
            .store()
            .ensure_approval_request(NewApproval {
                run_id: run_id.clone(),
                scope: meta.scope.clone(),
                intent_summary: meta.intent_summary.clone(),
                metadata: meta.metadata.clone(),
            })
            .await?;

        self.store().mark_run_waiting(&run_id).await?;
        let waiting = json!({ "approvalId": request.approval_id, "scope": request.scope });
        self.store()
            .mark_run_step_status(&run_id, &step.step_id, StepStatus::Waiting, Some(waiting.clone()))
            .await?;
        self.emit(RunStreamEvent::step_finished(
            &run_id,
            &step.step_id,
            StepStatus::Waiting,
            Some(waiting),
            None,
        ))
        .await;
        info!(
            run_id = %run_id,
            step_id = %step.step_id,
            approval_id = %request.approval_id,
            scope = %request.scope,
            "waiting for approval"
        );

        let decision = self
            .approvals()
            .wait(&run_id, &request.approval_id, self.cancel_token())
            .await?;

        let outputs = serde_json::to_value(&decision).context("Failed to serialize approval decision")?;
        self.store()
            .finish_run_step(
                &run_id,
                &step.step_id,
                StepFinish::succeeded(outputs.clone(), outputs.clone()),
            )
            .await?;
        self.emit(RunStreamEvent::step_finished(
            &run_id,
            &step.step_id,
            StepStatus::Succeeded,
            Some(outputs),
            None,
        ))
        .await;
        self.clear_active_step(&step.step_id);
        info!(
            run_id = %run_id,
            step_id = %step.step_id,
            approved_by = %decision.approved_by,
            "approval granted"
        );

        Ok(decision)
    }
}
