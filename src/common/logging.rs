//! Logging and tracing configuration
//!
//! Logs go to stderr so they never interleave with the per-action result
//! lines printed on stdout. An optional log file captures the full trace of
//! a run, including every span field.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::paths;

/// Initialize tracing for a CLI run
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate (DEBUG when verbose), WARN for
/// dependencies. When `log_file` is set the run is also written to
/// `<log dir>/scenario.log`; the returned guard must be held until exit.
pub fn init_cli(verbose: bool, log_file: bool) -> Option<WorkerGuard> {
    let default_filter = if verbose {
        "scenario=debug,warn"
    } else {
        "scenario=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let file_writer = if log_file {
        match paths::ensure_log_dir() {
            Ok(Some(dir)) => Some(tracing_appender::non_blocking(
                tracing_appender::rolling::never(dir, "scenario.log"),
            )),
            Ok(None) => None,
            Err(e) => {
                eprintln!("Warning: Could not create log directory: {}", e);
                None
            }
        }
    } else {
        None
    };

    match file_writer {
        Some((writer, guard)) => {
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}
