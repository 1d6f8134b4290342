//! Diagnostic logging setup.
//!
//! Short-lived CLI invocations log to stderr at `warn` by default. The daemon
//! appends to its log file (rotated at startup) and mirrors to stderr, at
//! `info` by default. `RUST_LOG` overrides either.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Rotate the daemon log once it grows past this size.
pub const MAX_LOG_BYTES: u64 = 1024 * 1024;

/// Rotated generations kept (`.1` is the newest).
pub const KEEP_ROTATED: usize = 3;

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Logging for CLI commands and hooks.
pub fn init_cli(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::registry()
        .with(filter(default))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

/// Logging for the daemon process: append to `log_path` and mirror to stderr.
pub fn init_daemon(log_path: &Path, verbose: bool) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
    }
    rotate_if_needed(log_path, MAX_LOG_BYTES)?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file: {}", log_path.display()))?;

    let default = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::registry()
        .with(filter(default))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_thread_names(true),
        )
        .try_init();
    Ok(())
}

/// Shift `log` to `log.1`, `log.1` to `log.2` and so on when it exceeds
/// `max_bytes`. The oldest generation is discarded. Returns whether a
/// rotation happened.
pub fn rotate_if_needed(log: &Path, max_bytes: u64) -> Result<bool> {
    let size = match fs::metadata(log) {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to stat log file: {}", log.display()))
        }
    };
    if size <= max_bytes {
        return Ok(false);
    }

    for generation in (1..KEEP_ROTATED).rev() {
        let from = rotated(log, generation);
        if from.exists() {
            fs::rename(&from, rotated(log, generation + 1))
                .with_context(|| format!("Failed to rotate {}", from.display()))?;
        }
    }
    fs::rename(log, rotated(log, 1))
        .with_context(|| format!("Failed to rotate {}", log.display()))?;

    // Keep the file present so `tail -f` style readers reattach
    File::create(log).with_context(|| format!("Failed to create {}", log.display()))?;
    Ok(true)
}

fn rotated(log: &Path, generation: usize) -> PathBuf {
    let mut name = log.as_os_str().to_os_string();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}
