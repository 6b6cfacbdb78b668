//! Log sinks: stderr, the append-only dispatch log and the security log.

use crate::SECURITY_TARGET;
use std::error::Error;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::filter::{EnvFilter, LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{Layer as _, fmt};

pub const DISPATCH_LOG: &str = "dispatch.log";
pub const SECURITY_LOG: &str = "security.log";

fn stderr_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

/// Log to stderr only, for commands that do not touch the log directory.
pub fn init_stderr(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(stderr_filter(verbose))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Log to stderr plus the two files in `log_dir`, which is created if needed.
pub fn init(log_dir: &Path, verbose: bool) -> Result<(), Box<dyn Error>> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("log directory {}: {e}", log_dir.display()))?;

    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter(verbose));
    let dispatch_log = fmt::layer()
        .with_ansi(false)
        .with_writer(tracing_appender::rolling::never(log_dir, DISPATCH_LOG))
        .with_filter(if verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        });
    let security_log = fmt::layer()
        .with_ansi(false)
        .with_writer(tracing_appender::rolling::never(log_dir, SECURITY_LOG))
        .with_filter(Targets::new().with_target(SECURITY_TARGET, Level::TRACE));

    tracing_subscriber::registry()
        .with(stderr)
        .with(dispatch_log)
        .with(security_log)
        .try_init()?;
    Ok(())
}
