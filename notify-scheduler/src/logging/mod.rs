//! Logging setup: `RUST_LOG`-driven filter, console output and optional
//! daily log files.

use chrono::{Local, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "notify_scheduler=info,sqlx=warn";

/// Rolled log files are named `<prefix>.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "notify-scheduler.log";

/// Log retention period in days.
pub const LOG_RETENTION_DAYS: i64 = 7;

/// Timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Filter from a `RUST_LOG`-style directive, falling back to
/// [`DEFAULT_LOG_FILTER`] when it is missing or invalid.
fn filter_from(directive: Option<&str>) -> EnvFilter {
    directive
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global subscriber.
///
/// Console output is always on. With `log_dir`, events are also written to
/// a daily-rolling file there; keep the returned guard alive until exit so
/// buffered lines are flushed.
pub fn init_logging(log_dir: Option<&str>) -> crate::Result<Option<WorkerGuard>> {
    let directive = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = filter_from(directive.as_deref());

    let (file_layer, guard) = match log_dir.map(PathBuf::from) {
        Some(path) => {
            std::fs::create_dir_all(&path)?;
            let file_appender = tracing_appender::rolling::daily(&path, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    Ok(guard)
}

/// Delete rolled log files older than `retention_days`. Returns how many
/// files were removed.
pub async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(date_str) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(LOG_FILE_PREFIX))
            .and_then(|n| n.strip_prefix('.'))
        else {
            continue;
        };

        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };
        if file_date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted_count += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }
    Ok(deleted_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("notify_scheduler=info"));
        assert!(DEFAULT_LOG_FILTER.contains("sqlx=warn"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_filter_falls_back_to_default() {
        for directive in [None, Some("notify_scheduler=verbose")] {
            let filter = filter_from(directive).to_string();
            assert!(filter.contains("notify_scheduler=info"), "{}", filter);
            assert!(filter.contains("sqlx=warn"), "{}", filter);
        }

        let filter = filter_from(Some("notify_scheduler=debug")).to_string();
        assert!(filter.contains("notify_scheduler=debug"), "{}", filter);
        assert!(!filter.contains("sqlx"), "{}", filter);
    }

    #[tokio::test]
    async fn test_cleanup_old_logs() {
        let dir = tempfile::tempdir().unwrap();
        let old = (Utc::now() - chrono::Duration::days(30)).format("%Y-%m-%d");
        let today = Utc::now().format("%Y-%m-%d");
        std::fs::write(dir.path().join(format!("{}.{}", LOG_FILE_PREFIX, old)), "old").unwrap();
        std::fs::write(dir.path().join(format!("{}.{}", LOG_FILE_PREFIX, today)), "new").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), "keep").unwrap();

        let deleted = cleanup_old_logs(dir.path(), LOG_RETENTION_DAYS).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(dir.path().join(format!("{}.{}", LOG_FILE_PREFIX, today)).exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }
}
