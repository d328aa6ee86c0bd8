use anyhow::Result;
use runway_common::Run;
use serde_json::{Value, json};

use crate::orchestrator::RunContext;
use crate::orchestrator::pipeline::RUN_START;
use crate::store::StepMeta;

/// Research runs only record their start; the shared tail does the rest.
pub async fn run(ctx: &mut RunContext, run: &Run) -> Result<()> {
    ctx.run_step(StepMeta::tool(RUN_START, "Start run"), || start(run))
        .await?;
    Ok(())
}

async fn start(run: &Run) -> Result<Value> {
    Ok(json!({
        "runId": run.id,
        "kind": run.kind,
        "projectId": run.project_id,
        "intent": run.intent,
    }))
}
