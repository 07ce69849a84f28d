//! Client configuration: defaults, then environment, then CLI flags.

use hotattach_protocol::{parse_signal, runtime_dir, DEFAULT_SIGNAL};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const SIGNAL_ENV: &str = "HOTATTACH_SIGNAL";
const POLL_INTERVAL_ENV: &str = "HOTATTACH_POLL_INTERVAL_MS";
const MAX_ATTEMPTS_ENV: &str = "HOTATTACH_MAX_ATTEMPTS";

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 50;

#[derive(Debug, Clone)]
pub struct AttachConfig {
    pub runtime_dir: PathBuf,
    /// Sent when the marker body does not name the armed signal.
    pub signal: i32,
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            runtime_dir: runtime_dir(),
            signal: DEFAULT_SIGNAL,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl AttachConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = env::var(SIGNAL_ENV) {
            match parse_signal(&value) {
                Ok(signal) => config.signal = signal,
                Err(err) => warn!(error = %err, "Ignoring invalid {}", SIGNAL_ENV),
            }
        }
        if let Some(ms) = env_number::<u64>(POLL_INTERVAL_ENV) {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_number::<u32>(MAX_ATTEMPTS_ENV).filter(|n| *n > 0) {
            config.max_attempts = attempts;
        }

        config
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(number) => Some(number),
        Err(_) => {
            warn!(value = %value, "Ignoring invalid {}", name);
            None
        }
    }
}
