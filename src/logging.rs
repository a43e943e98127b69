//! Process logging setup.
//!
//! Human-readable or JSON lines go to stderr so that stdout stays free for
//! command output (`run --json` streams updates there). When a log directory
//! is configured, a daily-rolling JSON file is written as well.

use anyhow::{Result, anyhow};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LoggingSection};

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "CUTOVER_LOG";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Filter directive: `CUTOVER_LOG`, then `RUST_LOG`, then `--verbose`, then config.
fn resolve_directive(
    cutover_log: Option<String>,
    rust_log: Option<String>,
    configured: &str,
    verbose: bool,
) -> String {
    cutover_log
        .or(rust_log)
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| {
            if verbose {
                "debug".to_string()
            } else {
                configured.to_string()
            }
        })
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
pub fn init(
    config: &LoggingSection,
    log_dir: Option<&Path>,
    verbose: bool,
) -> Result<Option<WorkerGuard>> {
    let directive = resolve_directive(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        &config.level,
        verbose,
    );
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| anyhow!("Invalid log filter '{}': {}", directive, e))?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    layers.push(match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    });

    let guard = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| anyhow!("Failed to create log directory {}: {}", dir.display(), e))?;
            let appender = tracing_appender::rolling::daily(dir, "cutover.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_precedence() {
        assert_eq!(
            resolve_directive(Some("cutover=trace".into()), Some("warn".into()), "info", true),
            "cutover=trace"
        );
        assert_eq!(
            resolve_directive(None, Some("warn".into()), "info", true),
            "warn"
        );
        assert_eq!(resolve_directive(None, None, "info", true), "debug");
        assert_eq!(resolve_directive(None, None, "error", false), "error");
        // blank env values fall through
        assert_eq!(resolve_directive(Some(" ".into()), None, "info", false), "info");
    }
}
