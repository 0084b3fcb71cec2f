//! Tracing subscriber setup

use crate::config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber
///
/// `RUST_LOG` wins over the configured level. With a log directory set,
/// output also goes to a daily rolling `turnkey.log` there; keep the
/// returned guard alive so buffered lines get flushed.
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "turnkey.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
            None
        }
    }
}
