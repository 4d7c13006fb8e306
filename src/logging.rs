//! Tracing setup.
//!
//! Everything goes to stderr, filtered by `RUST_LOG` (default `warn`, or
//! `info` for verbose commands). `APPVM_LOG=1` adds a plain-text copy at
//! `$XDG_DATA_HOME/appvm/appvm.log` (falling back to `~/.local/share`).

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "APPVM_LOG";

/// Keeps the file writer alive; dropping it flushes buffered lines.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

pub fn init(verbose: bool) -> LogGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "info" } else { "warn" }));

    let (file_layer, guard) = if std::env::var(LOG_ENV).as_deref() == Ok("1") {
        let dir = log_dir(
            std::env::var_os("XDG_DATA_HOME").map(PathBuf::from),
            std::env::var_os("HOME").map(PathBuf::from),
        );
        let _ = std::fs::create_dir_all(&dir);
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
            dir,
            "appvm.log",
        ));
        (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    LogGuard { _file: guard }
}

fn log_dir(xdg_data: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    match (xdg_data, home) {
        (Some(xdg), _) => xdg.join("appvm"),
        (None, Some(home)) => home.join(".local/share/appvm"),
        (None, None) => std::env::temp_dir().join("appvm"),
    }
}
