use std::sync::Arc;

use anyhow::Result;
use runway_common::{Run, RunStream, RunStreamEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::approvals::ApprovalWaiter;
use crate::errors::RunCanceled;
use crate::events::EventWriter;
use crate::store::RunStore;

/// State of one execution of one run.
///
/// Owned by the single sequential driver of the run. The active-step slot
/// lives here and mirrors `runs.active_step_id`.
pub struct RunContext {
    run_id: String,
    stream: RunStream,
    active_step: Option<String>,
    cancel: CancellationToken,
    store: Arc<dyn RunStore>,
    events: Arc<dyn EventWriter>,
    approvals: ApprovalWaiter,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        store: Arc<dyn RunStore>,
        events: Arc<dyn EventWriter>,
        approvals: ApprovalWaiter,
        cancel: CancellationToken,
    ) -> Self {
        let run_id = run_id.into();
        Self {
            stream: RunStream::new(run_id.clone()),
            run_id,
            active_step: None,
            cancel,
            store,
            events,
            approvals,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn stream(&self) -> &RunStream {
        &self.stream
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub(crate) fn approvals(&self) -> &ApprovalWaiter {
        &self.approvals
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn active_step(&self) -> Option<&str> {
        self.active_step.as_deref()
    }

    /// Load the run, racing the read against cancellation.
    ///
    /// On success the stream key gains the run's workflow id.
    pub async fn load_run(&mut self) -> Result<Run> {
        self.check_canceled()?;
        let run = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(RunCanceled::requested(&self.run_id).into());
            }
            run = self.store.get_run_info(&self.run_id) => run?,
        };
        self.stream = RunStream::new(run.id.clone()).with_workflow(run.workflow_run_id.clone());
        Ok(run)
    }

    pub fn check_canceled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RunCanceled::requested(&self.run_id).into());
        }
        Ok(())
    }

    /// Write an event. Failures are logged and never propagate.
    pub async fn emit(&self, event: RunStreamEvent) {
        debug!(run_id = %self.run_id, event = event.event_type(), "emit");
        if let Err(e) = self.events.write_run_event(&self.stream, &event).await {
            warn!(
                run_id = %self.run_id,
                event = event.event_type(),
                error = %format!("{:#}", e),
                "failed to write run event"
            );
        }
    }

    /// Persist `step_id` as running and claim the active-step slot.
    pub async fn begin_step(&mut self, step_id: &str) -> Result<()> {
        self.store.begin_run_step(&self.run_id, step_id).await?;
        self.active_step = Some(step_id.to_string());
        Ok(())
    }

    /// Release the slot if `step_id` holds it.
    pub fn clear_active_step(&mut self, step_id: &str) {
        if self.active_step.as_deref() == Some(step_id) {
            self.active_step = None;
        }
    }

    pub fn take_active_step(&mut self) -> Option<String> {
        self.active_step.take()
    }

    /// Move the run back to `running` after an approval gate.
    pub async fn resume_running(&self) -> Result<()> {
        self.store.mark_run_running(&self.run_id).await
    }
}
