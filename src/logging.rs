use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

const LOG_FILE_BASENAME: &str = "klipper-watch.log";
const LOG_DIR_ENV: &str = "KLIPPER_WATCH_LOG_PATH";
const LOG_RETENTION_DAYS: u64 = 7;

/// Get the log directory path
pub fn get_log_dir(config: &LoggingConfig) -> Result<PathBuf> {
    resolve_log_dir(config)
}

pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    let log_dir = resolve_log_dir(config)?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;

    prune_old_logs(
        &log_dir,
        Duration::from_secs(60 * 60 * 24 * LOG_RETENTION_DAYS),
    );

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_BASENAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if config.debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(guard)
}

fn resolve_log_dir(config: &LoggingConfig) -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(LOG_DIR_ENV) {
        return Ok(PathBuf::from(override_path));
    }

    if let Some(path) = &config.log_path {
        return Ok(path.clone());
    }

    let proj_dirs = ProjectDirs::from("dev", "klipper-watch", "agent")
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

    let cutoff = SystemTime::now().checked_sub(max_age);
    let Some(cutoff) = cutoff else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let file_name = path.file_name().and_then(|name| name.to_str());
        let Some(file_name) = file_name else {
            continue;
        };

        if !file_name.starts_with(LOG_FILE_BASENAME) {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };

        let Ok(modified) = metadata.modified() else {
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

    #[test]
    fn test_config_log_path_used() {
        if std::env::var(LOG_DIR_ENV).is_ok() {
            return;
        }
        let config = LoggingConfig {
            debug: false,
            log_path: Some(PathBuf::from("/var/log/klipper-watch")),
        };
        assert_eq!(
            get_log_dir(&config).unwrap(),
            PathBuf::from("/var/log/klipper-watch")
        );
    }

    #[test]
    fn test_prune_only_touches_own_files() {
        let dir = tempfile::tempdir().unwrap();
        let ours = dir.path().join(format!("{}.2020-01-01", LOG_FILE_BASENAME));
        let other = dir.path().join("unrelated.txt");
        std::fs::write(&ours, "old").unwrap();
        std::fs::write(&other, "keep").unwrap();

        let month_ago = SystemTime::now() - Duration::from_secs(60 * 60 * 24 * 30);
        for path in [&ours, &other] {
            let file = std::fs::File::options().write(true).open(path).unwrap();
            file.set_modified(month_ago).unwrap();
        }

        prune_old_logs(dir.path(), Duration::from_secs(60 * 60 * 24 * LOG_RETENTION_DAYS));

        assert!(!ours.exists());
        assert!(other.exists());
    }
}
