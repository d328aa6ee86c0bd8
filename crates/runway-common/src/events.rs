//! Live lifecycle events for a run.
//!
//! Events are a projection of the persisted run and step rows, never the
//! system of record. Within one stream they are ordered: `run-started`
//! first, each `step-started` before its `step-finished`, and exactly one
//! `run-finished` last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use crate::models::StepErrorPayload;
use crate::models::{RunKind, StepKind, StepStatus, TerminalStatus};

/// Identifies the stream a run's events are written to.
///
/// `workflow_run_id` is unknown when the run's metadata could not be
/// loaded, so writers key streams by `run_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunStream {
    pub run_id: String,
    pub workflow_run_id: Option<String>,
}

impl RunStream {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_run_id: None,
        }
    }

    pub fn with_workflow(mut self, workflow_run_id: impl Into<String>) -> Self {
        self.workflow_run_id = Some(workflow_run_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunStreamEvent {
    #[serde(rename_all = "camelCase")]
    RunStarted {
        run_id: String,
        kind: RunKind,
        workflow_run_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    StepStarted {
        run_id: String,
        step_id: String,
        step_kind: StepKind,
        step_name: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    StepFinished {
        run_id: String,
        step_id: String,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outputs: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<StepErrorPayload>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    RunFinished {
        run_id: String,
        status: TerminalStatus,
        timestamp: DateTime<Utc>,
    },
}

impl RunStreamEvent {
    pub fn run_started(run_id: &str, kind: RunKind, workflow_run_id: &str) -> Self {
        Self::RunStarted {
            run_id: run_id.to_string(),
            kind,
            workflow_run_id: workflow_run_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn step_started(run_id: &str, step_id: &str, step_kind: StepKind, step_name: &str) -> Self {
        Self::StepStarted {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            step_kind,
            step_name: step_name.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn step_finished(
        run_id: &str,
        step_id: &str,
        status: StepStatus,
        outputs: Option<Value>,
        error: Option<StepErrorPayload>,
    ) -> Self {
        Self::StepFinished {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            status,
            outputs,
            error,
            timestamp: Utc::now(),
        }
    }

    pub fn run_finished(run_id: &str, status: TerminalStatus) -> Self {
        Self::RunFinished {
            run_id: run_id.to_string(),
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepFinished { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }

    /// Wire name of the event, matching the serialized `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run-started",
            Self::StepStarted { .. } => "step-started",
            Self::StepFinished { .. } => "step-finished",
            Self::RunFinished { .. } => "run-finished",
        }
    }
}
