//! Event writer contract.
//!
//! Writers must never block on a slow or absent consumer; the orchestrator
//! treats every write as best-effort and logs failures instead of failing
//! the run.

pub mod hub;
pub mod lines;

use anyhow::Result;
use async_trait::async_trait;
use runway_common::{RunStream, RunStreamEvent};

pub use hub::{EventHub, Subscription};
pub use lines::JsonLinesWriter;

#[async_trait]
pub trait EventWriter: Send + Sync {
    async fn write_run_event(&self, stream: &RunStream, event: &RunStreamEvent) -> Result<()>;

    /// End the stream; subscribers see it close.
    async fn close_run_stream(&self, stream: &RunStream) -> Result<()>;
}
