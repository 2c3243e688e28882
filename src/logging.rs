//! Diagnostic logging
//!
//! stdout belongs to the status protocol, so diagnostics go to a daily
//! rolling file plus stderr, never to stdout.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_BASENAME: &str = "screenrec.log";
const LOG_DIR_ENV: &str = "SCREENREC_LOG_PATH";
const LOG_RETENTION_DAYS: u64 = 7;

/// Initialize logging to file and stderr.
///
/// If the log directory cannot be created (read-only system partition, no
/// HOME for the privileged user) logging degrades to stderr only and `None`
/// is returned instead of a guard.
pub fn init_logging() -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match prepare_log_dir() {
        Ok(log_dir) => {
            let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_BASENAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(plain_layer(non_blocking))
                .with(plain_layer(std::io::stderr))
                .init();

            Some(guard)
        }
        Err(e) => {
            stderr_subscriber(env_filter, std::io::stderr).init();

            tracing::warn!("File logging disabled: {:#}", e);
            None
        }
    }
}

/// Subscriber used when no log directory is available
fn stderr_subscriber<W>(env_filter: EnvFilter, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(env_filter)
        .with(plain_layer(writer))
}

/// Uncolored fmt layer with thread names (`main`, `command`, ...)
fn plain_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_names(true)
}

fn prepare_log_dir() -> Result<PathBuf> {
    let log_dir = resolve_log_dir()?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;

    prune_old_logs(
        &log_dir,
        Duration::from_secs(60 * 60 * 24 * LOG_RETENTION_DAYS),
    );

    Ok(log_dir)
}

fn resolve_log_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(LOG_DIR_ENV) {
        return Ok(PathBuf::from(override_path));
    }

    let proj_dirs = ProjectDirs::from("dev", "screenrec", "screenrec")
        .context("Failed to determine project directories for log path")?;

    let base = proj_dirs
        .state_dir()
        .unwrap_or_else(|| proj_dirs.data_local_dir());
    Ok(base.join("logs"))
}

fn prune_old_logs(log_dir: &Path, max_age: Duration) {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };

    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_BASENAME));
        if !is_log {
            continue;
        }

        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };

        if modified < cutoff {
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_stderr_only_subscriber_filters_levels() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = stderr_subscriber(EnvFilter::new("info"), move || writer.clone());

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("hidden detail");
            tracing::warn!("File logging disabled: read-only");
        });

        let text = captured.text();
        assert!(text.contains("WARN"));
        assert!(text.contains("File logging disabled: read-only"));
        assert!(!text.contains("hidden detail"));
        assert!(!text.contains('\u{1b}'));
    }

    #[test]
    fn test_prune_removes_only_stale_logs() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join(format!("{}.2026-10-01", LOG_FILE_BASENAME));
        let fresh = dir.path().join(format!("{}.2026-10-19", LOG_FILE_BASENAME));
        let foreign = dir.path().join("other.txt");
        for path in [&stale, &fresh, &foreign] {
            std::fs::write(path, "log").unwrap();
        }

        let two_hours_ago = SystemTime::now() - Duration::from_secs(2 * 60 * 60);
        for path in [&stale, &foreign] {
            let file = std::fs::File::options().write(true).open(path).unwrap();
            file.set_modified(two_hours_ago).unwrap();
        }

        prune_old_logs(dir.path(), Duration::from_secs(60 * 60));

        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(foreign.exists());
    }
}
