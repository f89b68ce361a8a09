use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE: &str = "vantage.log";

// Stdout belongs to the command loop, so everything goes to a daily file.
pub fn initialize_logging(dir: impl AsRef<Path>) -> WorkerGuard {
    let dir = dir.as_ref();
    let created = std::fs::create_dir_all(dir);

    let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // RUST_LOG wins; otherwise our own modules log their filter decisions too.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vantage=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    if let Err(e) = created {
        tracing::warn!("Could not create log directory {}: {}", dir.display(), e);
    }
    tracing::info!("Logging to {}", dir.join(LOG_FILE).display());
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_the_log_directory() {
        let dir = std::env::temp_dir().join(format!("vantage-logs-{}", std::process::id()));
        let guard = initialize_logging(&dir);
        tracing::info!("hello");
        drop(guard);

        assert!(dir.is_dir());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
