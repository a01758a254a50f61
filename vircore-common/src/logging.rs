//! Structured logging initialization shared by vircore binaries.
//!
//! Two entry points: [`init_logging`] for interactive console output,
//! [`init_logging_json`] for log-aggregation-friendly output. Both
//! honor `RUST_LOG` when set, falling back to the caller-supplied level.

use std::path::Path;

use anyhow::Result;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Initialize console logging: colorized, local-time timestamps,
/// target/file/line, thread ids.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
                .with_span_events(FmtSpan::CLOSE),
        )
        .init();

    tracing::info!(level, "logging initialized");
    Ok(())
}

/// Initialize JSON logging, suitable for a log-aggregation pipeline.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true),
        )
        .init();

    tracing::info!(level, "logging initialized (json)");
    Ok(())
}

/// Initialize console logging plus a rolling file sink under `log_dir`,
/// for daemon deployments that want both (§4.10 `log_dir`).
pub fn init_logging_with_file(level: &str, log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "vircored.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Leaking the guard is intentional: it must outlive the subscriber,
    // which lives for the whole process.
    std::mem::forget(guard);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true).with_target(true))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking).json())
        .init();

    tracing::info!(level, log_dir = %log_dir.display(), "logging initialized (console + file)");
    Ok(())
}
