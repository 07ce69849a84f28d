//! Target configuration.
//!
//! Defaults come from [`DebuggerConfig::default`], environment variables can
//! override them through [`DebuggerConfig::from_env`], and hosts refine the
//! result with the builder methods.

use hotattach_protocol::{parse_signal, runtime_dir, DEFAULT_SIGNAL};
use std::env;
use std::path::{Path, PathBuf};
use tracing::warn;

const MODE_ENV: &str = "HOTATTACH_MODE";
const SIGNAL_ENV: &str = "HOTATTACH_SIGNAL";

/// When a debugging session may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Only after an unhandled fault.
    Reactive,
    /// Armed at startup; the activation signal starts a session at any time.
    Proactive,
}

/// Where the session endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// Unix stream socket at `{runtime-dir}/{pid}-debug-socket`.
    Unix,
    /// TCP listener; `local` binds loopback only.
    Tcp { port: u16, local: bool },
}

#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    pub mode: Mode,
    pub signal: i32,
    pub runtime_dir: PathBuf,
    pub transport: TransportKind,
    /// Signals on which the readiness marker is removed before the process dies.
    pub teardown_signals: Vec<i32>,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Reactive,
            signal: DEFAULT_SIGNAL,
            runtime_dir: runtime_dir(),
            transport: TransportKind::Unix,
            teardown_signals: vec![libc::SIGTERM, libc::SIGHUP],
        }
    }
}

impl DebuggerConfig {
    /// Defaults plus `HOTATTACH_MODE`, `HOTATTACH_SIGNAL` and `HOTATTACH_RUNTIME_DIR`.
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = env::var(MODE_ENV) {
            match value.to_ascii_lowercase().as_str() {
                "proactive" | "always" => config.mode = Mode::Proactive,
                "reactive" | "fault" => config.mode = Mode::Reactive,
                other => warn!(value = other, "Ignoring unknown {}", MODE_ENV),
            }
        }

        if let Ok(value) = env::var(SIGNAL_ENV) {
            match parse_signal(&value) {
                Ok(signal) => config.signal = signal,
                Err(err) => warn!(error = %err, "Ignoring invalid {}", SIGNAL_ENV),
            }
        }

        config
    }

    pub fn proactive(mut self) -> Self {
        self.mode = Mode::Proactive;
        self
    }

    pub fn reactive(mut self) -> Self {
        self.mode = Mode::Reactive;
        self
    }

    pub fn with_signal(mut self, signal: i32) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.runtime_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn tcp(mut self, port: u16, local: bool) -> Self {
        self.transport = TransportKind::Tcp { port, local };
        self
    }

    pub fn with_teardown_signals(mut self, signals: Vec<i32>) -> Self {
        self.teardown_signals = signals;
        self
    }
}
