//! Tracing initialization.
//!
//! `RUST_LOG` overrides the --log-level flag when set, so operators can
//! raise verbosity per-module without touching the spawner configuration.

use tracing_subscriber::EnvFilter;

use crate::cli::{LogFormat, LogLevel};

pub fn init_tracing(level: LogLevel, format: LogFormat, show_caller: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_file(show_caller)
        .with_line_number(show_caller);

    let initialized = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };

    if initialized.is_err() {
        // A subscriber was already installed (tests); keep going.
    }
}
