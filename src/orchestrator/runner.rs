use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use runway_common::{RunKind, RunStatus, RunStreamEvent, StepStatus, TerminalStatus};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::RunContext;
use super::registry::CancelRegistry;
use crate::approvals::ApprovalWaiter;
use crate::config::RunwayConfig;
use crate::errors::{RunCanceled, is_cancellation};
use crate::events::EventWriter;
use crate::steps::{self, StepServices};
use crate::store::{RunStore, SqliteRunStore, StepFinish};

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// How often an execution checks the store for a cancel request.
    pub cancel_poll: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            cancel_poll: Duration::from_secs(5),
        }
    }
}

/// How a successful `execute_run` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The pipeline ran to completion.
    Completed,
    /// The run was already terminal; nothing was executed.
    AlreadyFinished(RunStatus),
}

/// Top-level driver: loads a run, walks its pipeline and classifies the
/// outcome. The single place that writes terminal run state.
pub struct RunOrchestrator {
    store: Arc<dyn RunStore>,
    events: Arc<dyn EventWriter>,
    approvals: ApprovalWaiter,
    services: Arc<StepServices>,
    cancels: CancelRegistry,
    settings: OrchestratorSettings,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        events: Arc<dyn EventWriter>,
        approvals: ApprovalWaiter,
        services: Arc<StepServices>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            events,
            approvals,
            services,
            cancels: CancelRegistry::new(),
            settings,
        }
    }

    /// Wire an orchestrator over `store` with the shipped collaborators.
    pub fn from_config(
        config: &RunwayConfig,
        store: SqliteRunStore,
        events: Arc<dyn EventWriter>,
    ) -> Result<Self> {
        let store = Arc::new(store);
        let approvals = ApprovalWaiter::new(store.clone(), config.orchestrator.approval_poll());
        let services = StepServices::from_config(config)?;
        Ok(Self::new(
            store,
            events,
            approvals,
            Arc::new(services),
            OrchestratorSettings {
                cancel_poll: config.orchestrator.cancel_poll(),
            },
        ))
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn approvals(&self) -> &ApprovalWaiter {
        &self.approvals
    }

    pub fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    /// Execute (or resume) a run to a terminal state or a parked gate.
    ///
    /// The error that ended the run is returned unchanged after its terminal
    /// bookkeeping; bookkeeping failures are logged, never returned.
    pub async fn execute_run(&self, run_id: &str) -> Result<RunOutcome> {
        let cancel = self.cancels.register(run_id);
        let watcher = self.spawn_cancel_watcher(run_id, cancel.clone());
        let mut ctx = RunContext::new(
            run_id,
            self.store.clone(),
            self.events.clone(),
            self.approvals.clone(),
            cancel,
        );

        let result = match self.drive(&mut ctx).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.record_failure(&mut ctx, &err).await;
                Err(err)
            }
        };

        watcher.abort();
        self.cancels.remove(run_id);
        if let Err(e) = self.events.close_run_stream(ctx.stream()).await {
            warn!(run_id = %run_id, error = %format!("{:#}", e), "failed to close run stream");
        }
        result
    }

    async fn drive(&self, ctx: &mut RunContext) -> Result<RunOutcome> {
        let run = ctx.load_run().await?;
        if run.status.is_terminal() {
            info!(run_id = %run.id, status = %run.status, "run already finished");
            return Ok(RunOutcome::AlreadyFinished(run.status));
        }
        if run.cancel_requested_at.is_some() {
            return Err(RunCanceled::requested(&run.id).into());
        }

        ctx.emit(RunStreamEvent::run_started(
            &run.id,
            run.kind,
            &run.workflow_run_id,
        ))
        .await;
        self.store.mark_run_running(&run.id).await?;
        info!(run_id = %run.id, kind = %run.kind, project_id = %run.project_id, "run started");

        match run.kind {
            RunKind::Research => steps::research::run(ctx, &run).await?,
            RunKind::Implementation => {
                steps::implementation::run(ctx, &self.services, &run).await?
            }
        }
        steps::finish_pipeline(ctx, &self.services, &run).await?;

        self.store
            .mark_run_terminal(&run.id, TerminalStatus::Succeeded)
            .await?;
        ctx.emit(RunStreamEvent::run_finished(&run.id, TerminalStatus::Succeeded))
            .await;
        info!(run_id = %run.id, "run succeeded");
        Ok(RunOutcome::Completed)
    }

    /// Terminal bookkeeping for a run that ended with `err`.
    async fn record_failure(&self, ctx: &mut RunContext, err: &anyhow::Error) {
        let run_id = ctx.run_id().to_string();

        if is_cancellation(err) {
            info!(run_id = %run_id, reason = %err, "run canceled");
            if let Some(step_id) = ctx.take_active_step() {
                if let Err(e) = self
                    .store
                    .finish_run_step(&run_id, &step_id, StepFinish::canceled())
                    .await
                {
                    warn!(run_id = %run_id, step_id = %step_id, error = %format!("{:#}", e), "failed to record canceled step");
                }
                ctx.emit(RunStreamEvent::step_finished(
                    &run_id,
                    &step_id,
                    StepStatus::Canceled,
                    None,
                    None,
                ))
                .await;
            }
            if let Err(e) = self.store.cancel_run_and_steps(&run_id).await {
                warn!(run_id = %run_id, error = %format!("{:#}", e), "failed to record run cancellation");
            }
            ctx.emit(RunStreamEvent::run_finished(&run_id, TerminalStatus::Canceled))
                .await;
            return;
        }

        let message = format!("{:#}", err);
        error!(run_id = %run_id, step_id = ?ctx.active_step(), error = %message, "run failed");
        if let Some(step_id) = ctx.take_active_step() {
            let finish = StepFinish::failed(message.clone());
            let payload = finish.error.clone();
            if let Err(e) = self.store.finish_run_step(&run_id, &step_id, finish).await {
                warn!(run_id = %run_id, step_id = %step_id, error = %format!("{:#}", e), "failed to record failed step");
            }
            ctx.emit(RunStreamEvent::step_finished(
                &run_id,
                &step_id,
                StepStatus::Failed,
                None,
                payload,
            ))
            .await;
        }
        if let Err(e) = self
            .store
            .mark_run_terminal(&run_id, TerminalStatus::Failed)
            .await
        {
            warn!(run_id = %run_id, error = %format!("{:#}", e), "failed to mark run failed");
        }
        ctx.emit(RunStreamEvent::run_finished(&run_id, TerminalStatus::Failed))
            .await;
    }

    /// Fire `cancel` when another process records a cancel request.
    fn spawn_cancel_watcher(&self, run_id: &str, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.store.clone();
        let run_id = run_id.to_string();
        let interval = self.settings.cancel_poll;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                match store.is_cancel_requested(&run_id).await {
                    Ok(true) => {
                        info!(run_id = %run_id, "cancel request observed");
                        cancel.cancel();
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => debug!(run_id = %run_id, error = %e, "cancel poll failed"),
                }
            }
        })
    }
}
