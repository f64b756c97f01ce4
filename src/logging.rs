// Tracing initialization
//
// When a child is being wrapped, the parent's stdout and stderr belong to
// the passthrough, so logs go to a rotated file under the data directory.
// Direct and test modes log to stderr.
//
// Precedence for the filter: RUST_LOG env var > config > default "info".

use crate::config::Config;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing. The returned guard must be held for the process
/// lifetime or buffered log lines are lost.
pub fn init(config: &Config, wrapping_child: bool) -> Option<WorkerGuard> {
    let level = if config.monitoring.enabled {
        config.monitoring.log_level.as_str()
    } else {
        "error"
    };
    let default_filter = format!("codetap={level}");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    if wrapping_child {
        let log_dir = log_dir();
        let appender = tracing_appender::rolling::daily(log_dir, "codetap.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .try_init();
        Some(guard)
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
        None
    }
}

fn log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("codetap")
        .join("logs")
}
