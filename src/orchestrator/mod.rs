//! Durable run orchestration.
//!
//! A run is driven by one sequential task ([`RunOrchestrator::execute_run`])
//! through a fixed pipeline of steps. Each step goes through the step
//! runner, which persists its progress and checkpoint before the next step
//! starts, so a restarted process resumes after the last completed step.
//! Approval gates park the run in `waiting` on a durable approval row.
//!
//! Any error that escapes the pipeline is classified once, at the top:
//! cancellations end the run `canceled`, everything else `failed`.

mod approval_gate;
mod context;
pub mod launcher;
pub mod pipeline;
pub mod registry;
pub mod runner;
mod step_runner;

pub use approval_gate::ApprovalMeta;
pub use context::RunContext;
pub use launcher::RunLauncher;
pub use registry::CancelRegistry;
pub use runner::{OrchestratorSettings, RunOrchestrator, RunOutcome};
pub use step_runner::default_outputs;
