//! Typed error hierarchy for the runway orchestrator.
//!
//! Three enums and one struct cover the cases callers branch on:
//! - `RunCanceled` is the distinguished cancellation error
//! - `StoreError` covers persistence lookups and state conflicts
//! - `StepFailure` covers domain failures raised inside step bodies
//!
//! Everything else travels as `anyhow::Error`. Callers recover the typed
//! variants with `downcast_ref`, which also sees through `.context(...)`.

use thiserror::Error;

/// Why a run was canceled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Cancellation requested through the API, the CLI or another process.
    Requested,
    /// An approval gate was rejected.
    ApprovalRejected {
        approval_id: String,
        rejected_by: Option<String>,
    },
    /// The pending approval was withdrawn without a decision.
    ApprovalWithdrawn { approval_id: String },
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "cancellation requested"),
            Self::ApprovalRejected {
                approval_id,
                rejected_by: Some(by),
            } => write!(f, "approval {} rejected by {}", approval_id, by),
            Self::ApprovalRejected { approval_id, .. } => {
                write!(f, "approval {} rejected", approval_id)
            }
            Self::ApprovalWithdrawn { approval_id } => {
                write!(f, "approval {} withdrawn", approval_id)
            }
        }
    }
}

/// Raised when a run's cancellation interrupts a suspension point.
///
/// Routed through the cancellation path by the orchestrator and never
/// recorded as a failure.
#[derive(Debug, Clone, Error)]
#[error("Run {run_id} canceled: {reason}")]
pub struct RunCanceled {
    pub run_id: String,
    pub reason: CancelReason,
}

impl RunCanceled {
    pub fn requested(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            reason: CancelReason::Requested,
        }
    }
}

/// True when `err`, or any error in its source chain, is a cancellation.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<RunCanceled>().is_some())
}

/// Errors from the persistence layer that callers need to tell apart.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run {id} not found")]
    RunNotFound { id: String },

    #[error("Step {step_id} of run {run_id} not found")]
    StepNotFound { run_id: String, step_id: String },

    #[error("Approval {id} not found")]
    ApprovalNotFound { id: String },

    #[error("Approval {id} already resolved as {status}")]
    ApprovalAlreadyResolved { id: String, status: String },

    #[error("Run {run_id} already has active step {active}; cannot begin {requested}")]
    ActiveStepConflict {
        run_id: String,
        active: String,
        requested: String,
    },

    #[error("Run {id} is already {status}")]
    RunFinished { id: String, status: String },
}

/// Domain failures raised by step bodies.
#[derive(Debug, Error)]
pub enum StepFailure {
    #[error("Preflight failed: {0}")]
    Preflight(String),

    #[error("Sandbox command `{command}` failed with exit code {exit_code}: {output}")]
    SandboxCommand {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("Patch produced no changes")]
    EmptyPatch,

    #[error("Verify command `{command}` failed with exit code {exit_code}: {output}")]
    VerifyFailed {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("Failed to push branch {branch}: {message}")]
    PushFailed { branch: String, message: String },

    #[error("Checks failed: {}", failed.join(", "))]
    ChecksFailed { failed: Vec<String> },

    #[error("Checks did not finish within {waited_secs}s")]
    ChecksTimedOut { waited_secs: u64 },

    #[error("Merge of pull request #{number} failed: {message}")]
    MergeFailed { number: u64, message: String },

    #[error("Infrastructure endpoint for {operation} is not configured")]
    InfraNotConfigured { operation: String },
}
