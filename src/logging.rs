// Tracing setup: stderr plus an optional daily-rolling log file

use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Settings;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_PREFIX: &str = "bootstick.log";

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("warn,bootstick_imager={level},bootstick={level}"))
    })
}

fn file_writer(dir: &Path) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir).map_err(|e| {
        anyhow::anyhow!("create log directory failed: {} ({})", dir.display(), e)
    })?;

    let appender = tracing_appender::rolling::daily(dir, LOG_PREFIX);
    Ok(tracing_appender::non_blocking(appender))
}

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init(settings: &Settings, verbose: bool) {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    let file_layer = if settings.log_to_file {
        match file_writer(&settings.log_dir()) {
            Ok((writer, guard)) => {
                let _ = LOG_GUARD.set(guard);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_target(true)
                        .with_ansi(false),
                )
            }
            Err(e) => {
                eprintln!("bootstick: failed to initialize file logging: {e:#}");
                None
            }
        }
    } else {
        None
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}
