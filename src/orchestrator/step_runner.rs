//! Persistence bookkeeping and event emission around a step body.
//!
//! ```text
//! ensure row ──► already succeeded? ──yes──► return checkpoint (no events)
//!                       │ no
//!                       ▼
//!                 begin (running) ──► step-started ──► body ─┬─ Ok  ──► finish(succeeded) ──► step-finished
//!                                                            └─ Err ──► propagate unmodified
//! ```

use std::future::Future;

use anyhow::{Context, Result};
use runway_common::{RunStep, RunStreamEvent, StepStatus};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::context::RunContext;
use crate::errors::RunCanceled;
use crate::store::{StepFinish, StepMeta};

/// Outputs for a step result: records as-is, anything else under `value`.
pub fn default_outputs<T: Serialize>(result: &T) -> Result<Value> {
    let value = serde_json::to_value(result).context("Failed to serialize step result")?;
    Ok(match value {
        Value::Object(_) => value,
        other => json!({ "value": other }),
    })
}

/// Recover a step result from a succeeded row.
pub(crate) fn replay<T: DeserializeOwned>(row: &RunStep) -> Result<T> {
    let stored = row
        .checkpoint
        .clone()
        .or_else(|| row.outputs.clone())
        .unwrap_or(Value::Null);
    serde_json::from_value(stored).with_context(|| {
        format!(
            "Failed to restore checkpoint of step {} in run {}",
            row.step_id, row.run_id
        )
    })
}

impl RunContext {
    /// Run `body` as the step described by `meta`.
    pub async fn run_step<T, F, Fut>(&mut self, meta: StepMeta, body: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_step_with(meta, body, default_outputs).await
    }

    /// Like [`run_step`](Self::run_step) with a custom projection of the
    /// result into the step's persisted and streamed outputs.
    pub async fn run_step_with<T, F, Fut, O>(
        &mut self,
        meta: StepMeta,
        body: F,
        to_outputs: O,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        O: FnOnce(&T) -> Result<Value>,
    {
        self.check_canceled()?;

        let run_id = self.run_id().to_string();
        let row = self.store().ensure_run_step_row(&run_id, &meta).await?;
        if row.status == StepStatus::Succeeded {
            debug!(run_id = %run_id, step_id = %meta.step_id, "step already succeeded, replaying checkpoint");
            return replay(&row);
        }

        self.begin_step(&meta.step_id).await?;
        self.emit(RunStreamEvent::step_started(
            &run_id,
            &meta.step_id,
            meta.step_kind,
            &meta.step_name,
        ))
        .await;
        info!(run_id = %run_id, step_id = %meta.step_id, attempt = row.attempts + 1, "step started");

        let cancel = self.cancel_token().clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunCanceled::requested(&run_id).into()),
            result = body() => result?,
        };

        let outputs = to_outputs(&result)?;
        let checkpoint = serde_json::to_value(&result).context("Failed to serialize step result")?;
        self.store()
            .finish_run_step(
                &run_id,
                &meta.step_id,
                StepFinish::succeeded(outputs.clone(), checkpoint),
            )
            .await?;
        self.emit(RunStreamEvent::step_finished(
            &run_id,
            &meta.step_id,
            StepStatus::Succeeded,
            Some(outputs),
            None,
        ))
        .await;
        self.clear_active_step(&meta.step_id);
        info!(run_id = %run_id, step_id = %meta.step_id, "step succeeded");

        Ok(result)
    }
}
