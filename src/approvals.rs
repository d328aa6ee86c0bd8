//! Durable wait primitive for approval gates.
//!
//! A parked gate owns no in-memory state that matters: the approval row,
//! the gate's step row in `waiting` and the run in `waiting` are all
//! persisted. Waiting is a loop that re-reads the approval row whenever a
//! resolution is announced in this process or the poll interval elapses, so
//! a decision written by another process (or while this one was down) is
//! observed too.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use runway_common::{ApprovalDecision, ApprovalRequest, ApprovalStatus};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{CancelReason, RunCanceled, StoreError};
use crate::store::{ApprovalResolution, ApprovalStore};

#[derive(Clone)]
pub struct ApprovalWaiter {
    store: Arc<dyn ApprovalStore>,
    resolved_tx: broadcast::Sender<String>,
    poll_interval: Duration,
}

impl ApprovalWaiter {
    pub fn new(store: Arc<dyn ApprovalStore>, poll_interval: Duration) -> Self {
        let (resolved_tx, _) = broadcast::channel(64);
        Self {
            store,
            resolved_tx,
            poll_interval,
        }
    }

    pub fn store(&self) -> &Arc<dyn ApprovalStore> {
        &self.store
    }

    /// Wake every waiter in this process so it re-reads `approval_id`.
    pub fn notify_resolved(&self, approval_id: &str) {
        let _ = self.resolved_tx.send(approval_id.to_string());
    }

    /// Resolve an approval exactly once and wake local waiters.
    pub async fn resolve(
        &self,
        approval_id: &str,
        resolution: ApprovalResolution,
    ) -> Result<ApprovalRequest> {
        let resolved = self
            .store
            .resolve_approval(approval_id, resolution)
            .await?;
        info!(
            approval_id = %approval_id,
            run_id = %resolved.run_id,
            status = %resolved.status,
            "approval resolved"
        );
        self.notify_resolved(approval_id);
        Ok(resolved)
    }

    /// Block until `approval_id` is decided or `cancel` fires.
    ///
    /// Approval returns the decision. Rejection, withdrawal and
    /// cancellation all surface as [`RunCanceled`].
    pub async fn wait(
        &self,
        run_id: &str,
        approval_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ApprovalDecision> {
        // Subscribe before the first read so a resolution between the read
        // and the select is not missed.
        let mut resolved_rx = self.resolved_tx.subscribe();

        loop {
            let request = self
                .store
                .get_approval(approval_id)
                .await?
                .ok_or_else(|| StoreError::ApprovalNotFound {
                    id: approval_id.to_string(),
                })?;

            if let Some(decision) = request.decision() {
                return Ok(decision);
            }
            match request.status {
                ApprovalStatus::Rejected => {
                    return Err(RunCanceled {
                        run_id: run_id.to_string(),
                        reason: CancelReason::ApprovalRejected {
                            approval_id: approval_id.to_string(),
                            rejected_by: request.approved_by,
                        },
                    }
                    .into());
                }
                ApprovalStatus::Canceled => {
                    return Err(RunCanceled {
                        run_id: run_id.to_string(),
                        reason: CancelReason::ApprovalWithdrawn {
                            approval_id: approval_id.to_string(),
                        },
                    }
                    .into());
                }
                ApprovalStatus::Pending | ApprovalStatus::Approved => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RunCanceled::requested(run_id).into());
                }
                notified = resolved_rx.recv() => {
                    if let Ok(id) = notified {
                        debug!(approval_id = %id, "approval resolution announced");
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
