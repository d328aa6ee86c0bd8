//! `runway serve`.

use anyhow::Result;
use runway::config::RunwayConfig;

pub async fn cmd_serve(config: &RunwayConfig) -> Result<()> {
    runway::server::start_server(config).await
}
