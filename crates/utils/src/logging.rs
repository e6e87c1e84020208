//! provides logging helpers

use std::env;
use std::path::Path;
use std::path::PathBuf;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// When set, logs are additionally written to a daily rotated file under this path.
pub const LOG_PATH_ENV_VAR: &str = "LOG_PATH";

const DEFAULT_LOG_PREFIX: &str = "pcidevices.log";

/// Splits a log path into the rotation directory and the file prefix.
fn rotation_target(log_path: &Path) -> (PathBuf, String) {
    if log_path.is_dir() {
        return (log_path.to_path_buf(), DEFAULT_LOG_PREFIX.to_string());
    }
    let dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = log_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_LOG_PREFIX);
    (dir.to_path_buf(), prefix.to_string())
}

/// Builds the stderr formatting layer.
pub fn get_fmt_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer().with_writer(std::io::stderr).with_target(true)
}

/// initiate the global tracing subscriber
///
/// The returned guard must be held for the lifetime of the process when a
/// log file is configured, otherwise buffered lines are lost.
pub fn init() -> Option<WorkerGuard> {
    let env_filter = || {
        filter::EnvFilter::builder()
            .with_default_directive(filter::LevelFilter::INFO.into())
            .from_env_lossy()
    };

    let Some(log_path) = env::var(LOG_PATH_ENV_VAR).ok().filter(|p| !p.is_empty()) else {
        registry()
            .with(get_fmt_layer().with_filter(env_filter()))
            .init();
        return None;
    };

    let (dir, prefix) = rotation_target(Path::new(&log_path));
    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(&dir)
    {
        Ok(appender) => {
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter());
            registry()
                .with(get_fmt_layer().with_filter(env_filter()))
                .with(file_layer)
                .init();
            Some(guard)
        }
        Err(err) => {
            registry()
                .with(get_fmt_layer().with_filter(env_filter()))
                .init();
            tracing::error!(
                "failed to create rolling log appender at {}: {err}; logging to stderr only",
                dir.display()
            );
            None
        }
    }
}
