//! Logging setup for the `vhdm` binary.
//!
//! Filter comes from `VHDM_LOG`, then `RUST_LOG`, default `warn`; each `-v`
//! raises it one level. Everything goes to stderr so stdout stays parseable.
//! With `VHDM_LOG_FILE=1` a copy is written to `vhdm/vhdm.log` under the
//! user's data directory.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(verbosity: u8) -> LogGuard {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let file_guard = if std::env::var("VHDM_LOG_FILE").as_deref() == Ok("1") {
        let dir = log_dir();
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(dir, "vhdm.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter(verbosity))
            .with(stderr_layer)
            .with(file_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter(verbosity))
            .with(stderr_layer)
            .init();
        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}

fn filter(verbosity: u8) -> EnvFilter {
    match verbosity {
        0 => EnvFilter::try_from_env("VHDM_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    }
}

fn log_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("/tmp"))
        .join("vhdm")
}
