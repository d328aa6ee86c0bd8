use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use runway_common::{Run, RunStatus};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::runner::{RunOrchestrator, RunOutcome};
use crate::errors::{StoreError, is_cancellation};

/// Tracks in-process executions so a run is never driven twice at once.
#[derive(Clone)]
pub struct RunLauncher {
    orchestrator: Arc<RunOrchestrator>,
    running: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl RunLauncher {
    pub fn new(orchestrator: Arc<RunOrchestrator>) -> Self {
        Self {
            orchestrator,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn orchestrator(&self) -> &Arc<RunOrchestrator> {
        &self.orchestrator
    }

    /// Spawn an execution of `run_id`. Returns false if one is already live.
    pub async fn start(&self, run_id: &str) -> bool {
        let mut running = self.running.lock().await;
        running.retain(|_, handle| !handle.is_finished());
        if running.contains_key(run_id) {
            return false;
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        let tasks = Arc::clone(&self.running);
        let id = run_id.to_string();
        let handle = tokio::spawn(async move {
            match orchestrator.execute_run(&id).await {
                Ok(RunOutcome::Completed) => info!(run_id = %id, "execution completed"),
                Ok(RunOutcome::AlreadyFinished(status)) => {
                    info!(run_id = %id, status = %status, "execution skipped, run already finished")
                }
                Err(e) if is_cancellation(&e) => info!(run_id = %id, "execution canceled"),
                Err(e) => error!(run_id = %id, error = %format!("{:#}", e), "execution failed"),
            }
            tasks.lock().await.remove(&id);
        });
        running.insert(run_id.to_string(), handle);
        true
    }

    pub async fn is_running(&self, run_id: &str) -> bool {
        self.running
            .lock()
            .await
            .get(run_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Request cancellation of a run and return its current state.
    ///
    /// The request is persisted so other processes observe it too. A pending
    /// run that nothing executes is started so the orchestrator records the
    /// cancellation.
    pub async fn cancel(&self, run_id: &str) -> Result<Run> {
        let store = self.orchestrator.store();
        let run = store.get_run_info(run_id).await?;
        if run.status.is_terminal() || !store.request_cancel(run_id).await? {
            return Err(StoreError::RunFinished {
                id: run.id,
                status: run.status.to_string(),
            }
            .into());
        }

        let fired = self.orchestrator.cancels().cancel(run_id);
        info!(run_id = %run_id, in_process = fired, "cancel requested");
        if !fired && run.status == RunStatus::Pending && !self.is_running(run_id).await {
            self.start(run_id).await;
        }
        store.get_run_info(run_id).await
    }

    /// Start every pending, running or waiting run. Returns how many started.
    pub async fn resume_unfinished(&self) -> Result<usize> {
        let runs = self.orchestrator.store().list_unfinished_runs().await?;
        let mut started = 0;
        for run in runs {
            if self.start(&run.id).await {
                info!(run_id = %run.id, status = %run.status, "resuming run");
                started += 1;
            }
        }
        Ok(started)
    }

    /// Wait for every execution started so far.
    pub async fn join_all(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = self.running.lock().await.drain().collect();
        for (run_id, handle) in handles {
            if let Err(e) = handle.await {
                warn!(run_id = %run_id, error = %e, "execution task panicked");
            }
        }
    }

    /// Abort executions without canceling their runs; they resume on the
    /// next start.
    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        for (run_id, handle) in running.drain() {
            info!(run_id = %run_id, "stopping execution for shutdown");
            handle.abort();
        }
    }
}
