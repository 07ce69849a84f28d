//! Logging setup for binaries that embed the debugger.
//!
//! Events go to stderr so stdout stays free for the host's own output. With a
//! log directory, a daily-rotated file is written as well.

use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const DEBUG_LOG_ENV: &str = "HOTATTACH_DEBUG_LOG";

const LOG_FILE_PREFIX: &str = "hotattach.log";

/// Initializes the global subscriber. Returns the file writer guard, which
/// must be kept alive for buffered file output to be flushed.
///
/// Calling this after another subscriber is installed is a no-op.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = filter();

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init();
            None
        }
    }
}

fn filter() -> EnvFilter {
    if debug_forced(env::var(DEBUG_LOG_ENV).ok().as_deref()) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn debug_forced(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true" | "TRUE" | "yes" | "YES"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_values() {
        assert!(debug_forced(Some("1")));
        assert!(debug_forced(Some("yes")));
        assert!(!debug_forced(Some("0")));
        assert!(!debug_forced(None));
    }
}
