use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "info,multi_account_browser=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize tracing with a compact stdout layer.
///
/// - Default level: INFO (crate at DEBUG), override via RUST_LOG env
/// - Safe to call more than once; later calls are no-ops
pub fn init() {
    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(stdout_layer)
        .try_init();

    tracing::debug!("Tracing initialized");
}

/// Initialize tracing with stdout plus a daily-rolling JSON log file in `log_dir`.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init_with_log_dir(log_dir: &Path) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "orchestrator.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let file_layer = fmt::layer()
        .json()
        .with_current_span(false)
        .with_writer(file_writer);

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    tracing::info!(log_dir = %log_dir.display(), "Tracing initialized with file output");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_creates_dir() {
        let dir = std::env::temp_dir().join(format!("mab_logs_{}", uuid::Uuid::new_v4()));
        let guard = init_with_log_dir(&dir).unwrap();
        tracing::info!("written to file layer");
        drop(guard);
        assert!(dir.is_dir());
        // A second init is a no-op rather than a panic.
        init();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
