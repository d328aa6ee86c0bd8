use std::io::Write;

use anyhow::{Context, Result};
use async_trait::async_trait;
use runway_common::{RunStream, RunStreamEvent};

use super::EventWriter;

/// Writes each event as one JSON line to stdout.
#[derive(Debug, Default)]
pub struct JsonLinesWriter;

impl JsonLinesWriter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventWriter for JsonLinesWriter {
    async fn write_run_event(&self, _stream: &RunStream, event: &RunStreamEvent) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize run event")?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", json).context("Failed to write run event")?;
        stdout.flush().context("Failed to flush run event")
    }

    async fn close_run_stream(&self, _stream: &RunStream) -> Result<()> {
        Ok(())
    }
}
