//! Logging setup

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "uplink_core=info,uplink_agent=info";
const VERBOSE_FILTER: &str = "uplink_core=debug,uplink_agent=debug,tower_http=debug";

/// Log to stdout and to `log_file`. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init(log_file: &Path, verbose: bool) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER })
    });

    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let file_appender = tracing_appender::rolling::never(
        dir,
        log_file.file_name().unwrap_or(OsStr::new("uploader.log")),
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_thread_ids(true),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

/// Route panics through tracing so they land in the log file too
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()));
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        eprintln!("[PANIC] at {:?}: {}", location, payload);
        tracing::error!("PANIC at {:?}: {}", location, payload);
    }));
}
