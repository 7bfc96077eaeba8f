//! Diagnostics for the listener.
//!
//! stdout carries envelopes, so tracing output goes to
//! `<data dir>/logs/huddle.log`. `--verbose` mirrors it to stderr.

use std::path::PathBuf;

use clap::{Args, ValueEnum};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::paths;

const DEFAULT_FILTER: &str = "info,tokio_tungstenite=warn,tungstenite=warn";
const LOG_FILE: &str = "huddle.log";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Default, Args)]
pub struct LogArgs {
    /// Log filter directives (falls back to RUST_LOG)
    #[arg(long, global = true, env = "HUDDLE_LOG_FILTER")]
    pub log_filter: Option<String>,

    /// Log file format
    #[arg(long, global = true, env = "HUDDLE_LOG_FORMAT", value_enum, default_value_t)]
    pub log_format: LogFormat,

    /// Mirror log lines to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

pub struct LoggingHandle {
    pub log_path: PathBuf,
    _guard: WorkerGuard,
}

/// First valid of: explicit directives, `RUST_LOG`, the default.
fn resolve_filter(explicit: Option<&str>, from_env: Option<&str>) -> (EnvFilter, String) {
    [explicit, from_env]
        .into_iter()
        .flatten()
        .find_map(|directives| {
            EnvFilter::try_new(directives)
                .ok()
                .map(|filter| (filter, directives.to_string()))
        })
        .unwrap_or_else(|| (EnvFilter::new(DEFAULT_FILTER), DEFAULT_FILTER.to_string()))
}

pub fn init_logging(args: &LogArgs) -> anyhow::Result<LoggingHandle> {
    paths::ensure_dirs()?;
    let log_dir = paths::log_dir();
    let log_path = log_dir.join(LOG_FILE);

    let rust_log = std::env::var("RUST_LOG").ok();
    let (filter, directives) = resolve_filter(args.log_filter.as_deref(), rust_log.as_deref());

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&log_dir, LOG_FILE));
    let file_layer = match args.log_format {
        LogFormat::Json => fmt::layer()
            .with_writer(writer)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };
    let stderr_layer = args.verbose.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(filter)
        .try_init()?;

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        log_path = %log_path.display(),
        format = ?args.log_format,
        filter = %directives,
    );

    Ok(LoggingHandle {
        log_path,
        _guard: guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_filter_wins_over_rust_log() {
        let (_, directives) = resolve_filter(Some("huddle_realtime=debug"), Some("warn"));
        assert_eq!(directives, "huddle_realtime=debug");
    }

    #[test]
    fn invalid_filters_fall_through() {
        let (_, directives) = resolve_filter(Some("huddle=loud"), Some("warn"));
        assert_eq!(directives, "warn");

        let (_, directives) = resolve_filter(Some("huddle=loud"), None);
        assert_eq!(directives, DEFAULT_FILTER);

        let (_, directives) = resolve_filter(None, None);
        assert_eq!(directives, DEFAULT_FILTER);
    }
}
