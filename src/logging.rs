//! Tracing subscriber setup for the `runway` binary.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Default)]
pub struct LogOptions<'a> {
    pub verbose: bool,
    pub json: bool,
    /// Also write daily-rotated files into this directory.
    pub dir: Option<&'a Path>,
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "runway=debug,tower_http=debug" } else { "runway=info" }
}

/// Install the global subscriber. `RUST_LOG` wins over the defaults.
///
/// Keep the returned guard alive for the life of the process so buffered
/// file output is flushed on exit.
pub fn init(options: LogOptions<'_>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(options.verbose)));

    let (file_layer, guard) = match options.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "runway.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let result = if options.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init()
    };
    result.context("Failed to install tracing subscriber")?;

    Ok(guard)
}
