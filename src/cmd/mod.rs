//! CLI command implementations.
//!
//! | Module      | Commands handled                                     |
//! |-------------|------------------------------------------------------|
//! | `runs`      | `InitDb`, `Submit`, `Execute`, `Resume`, `Status`, `Runs`, `Cancel` |
//! | `approvals` | `Approvals`, `Approve`, `Reject`                     |
//! | `serve`     | `Serve`                                              |

pub mod approvals;
pub mod runs;
pub mod serve;

use std::sync::Arc;

use anyhow::Result;
use runway::config::RunwayConfig;
use runway::events::EventWriter;
use runway::orchestrator::RunOrchestrator;
use runway::store::SqliteRunStore;

pub use approvals::{cmd_approvals, cmd_approve, cmd_reject};
pub use runs::{
    cmd_cancel, cmd_execute, cmd_init_db, cmd_resume, cmd_runs, cmd_status, cmd_submit,
};
pub use serve::cmd_serve;

fn open_store(config: &RunwayConfig) -> Result<SqliteRunStore> {
    SqliteRunStore::open(&config.database.path)
}

fn orchestrator(
    config: &RunwayConfig,
    events: Arc<dyn EventWriter>,
) -> Result<Arc<RunOrchestrator>> {
    let store = open_store(config)?;
    Ok(Arc::new(RunOrchestrator::from_config(config, store, events)?))
}
