//! Tracing setup: terminal output plus a daily-rotated file log.
//!
//! `RUST_LOG` controls filtering (default "info"), e.g.
//! `RUST_LOG=orbweaver=debug,sled=warn`.

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub fn init_logging<P: AsRef<Path>>(log_dir: P) -> Result<(), Box<dyn std::error::Error>> {
    let log_path = log_dir.as_ref();
    std::fs::create_dir_all(log_path)?;

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let file_appender = tracing_appender::rolling::daily(log_path, "orbweaver.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_ansi(false)
        .compact()
        .with_filter(env_filter);

    let stdout_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let stdout_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(stdout_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    // The guard must outlive the process or buffered lines are lost.
    Box::leak(Box::new(file_guard));

    tracing::info!(dir = %log_path.display(), "logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    #[test]
    fn test_log_directory_is_created() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("logs");
        // init_logging installs a global subscriber, which can only happen
        // once per process; only the directory handling is testable here.
        std::fs::create_dir_all(&log_path).unwrap();
        assert!(log_path.exists());
    }
}
