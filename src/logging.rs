//! Tracing setup: console output, plus a daily-rolling log file when a log
//! directory is configured. `RUST_LOG` overrides the configured level.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::error::{MeterError, Result};

/// Initialize the global subscriber. The returned guard must be held for the
/// process lifetime to keep the file writer flushing.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(spec) => EnvFilter::try_new(spec),
        Err(_) => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| MeterError::config(format!("invalid log level: {e}")))?;

    let registry = tracing_subscriber::registry().with(filter);

    if let Some(dir) = &config.dir {
        let appender = tracing_appender::rolling::daily(dir, "metersrv.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_ansi(true))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .init();
        Ok(Some(guard))
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
        Ok(None)
    }
}
