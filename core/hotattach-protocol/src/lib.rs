//! Shared contract between a hotattach target and its clients.
//!
//! Both sides derive the transport address and the readiness marker from the
//! target pid with the functions in this crate, so the naming can never drift.
//! The target remains the only writer of those files; clients only stat,
//! read and connect.

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;

/// Overrides the directory that holds transports and markers.
pub const RUNTIME_DIR_ENV: &str = "HOTATTACH_RUNTIME_DIR";
pub const TRANSPORT_SUFFIX: &str = "-debug-socket";
pub const MARKER_SUFFIX: &str = ".dbg-enabled";
/// Upper bound on a single server output chunk read by the client.
pub const READ_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_SIGNAL: i32 = libc::SIGINT;
/// Prefix of the last line a target writes when a session ends abnormally.
pub const SESSION_END_PREFIX: &str = "*** session ended";
const MAX_MARKER_BYTES: u64 = 4096;

// ═══════════════════════════════════════════════════════════════════════════════
// Process identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Positive process identifier of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ProcessId(u32);

impl ProcessId {
    /// Returns `None` for zero and for values that do not fit a `pid_t`.
    pub fn new(raw: u32) -> Option<Self> {
        if raw == 0 || raw > i32::MAX as u32 {
            return None;
        }
        Some(Self(raw))
    }

    pub fn current() -> Self {
        Self(std::process::id())
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn as_raw(self) -> libc::pid_t {
        self.0 as libc::pid_t
    }
}

impl TryFrom<u32> for ProcessId {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        ProcessId::new(value).ok_or_else(|| format!("{} is not a valid pid", value))
    }
}

impl From<ProcessId> for u32 {
    fn from(pid: ProcessId) -> Self {
        pid.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProcessId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u32 = s
            .trim()
            .parse()
            .map_err(|_| format!("{} is an illegal value for pid", s))?;
        ProcessId::new(raw).ok_or_else(|| format!("{} is an illegal value for pid", s))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Filesystem naming
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolves the runtime directory: `HOTATTACH_RUNTIME_DIR` or the system temp dir.
pub fn runtime_dir() -> PathBuf {
    match env::var_os(RUNTIME_DIR_ENV) {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => env::temp_dir(),
    }
}

pub fn transport_path(dir: &Path, pid: ProcessId) -> PathBuf {
    dir.join(format!("{}{}", pid, TRANSPORT_SUFFIX))
}

pub fn marker_path(dir: &Path, pid: ProcessId) -> PathBuf {
    dir.join(format!("{}{}", pid, MARKER_SUFFIX))
}

/// Both filesystem addresses of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachPaths {
    pub transport: PathBuf,
    pub marker: PathBuf,
}

impl AttachPaths {
    pub fn new(dir: &Path, pid: ProcessId) -> Self {
        Self {
            transport: transport_path(dir, pid),
            marker: marker_path(dir, pid),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Readiness marker
// ═══════════════════════════════════════════════════════════════════════════════

/// Body of the readiness marker. Presence of the file is the actual signal;
/// this metadata only tells the client which signal the target armed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkerInfo {
    pub pid: ProcessId,
    pub signal: i32,
    pub armed_at: String,
    pub version: String,
}

impl MarkerInfo {
    pub fn new(pid: ProcessId, signal: i32, armed_at: DateTime<Utc>) -> Self {
        Self {
            pid,
            signal,
            armed_at: armed_at.to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(1..=max_signal()).contains(&self.signal) {
            return Err(format!("signal {} is out of range", self.signal));
        }
        if DateTime::parse_from_rfc3339(&self.armed_at).is_err() {
            return Err("armed_at must be an RFC 3339 timestamp".to_string());
        }
        Ok(())
    }
}

/// Writes the marker atomically with owner-only permissions. The temp file
/// gets a fresh random name in the marker's directory, so nothing else in a
/// shared runtime dir is touched.
pub fn write_marker(path: &Path, info: &MarkerInfo) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let payload = serde_json::to_vec(info).map_err(io::Error::other)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&payload)?;
    tmp.flush()?;
    tmp.as_file().set_permissions(std::fs::Permissions::from_mode(0o600))?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Reads the marker body. `None` when the marker is missing, oversized or its
/// body is not a valid `MarkerInfo`.
pub fn read_marker(path: &Path) -> Option<MarkerInfo> {
    let metadata = fs::metadata(path).ok()?;
    if !metadata.is_file() || metadata.len() > MAX_MARKER_BYTES {
        return None;
    }
    let data = fs::read(path).ok()?;
    let info: MarkerInfo = serde_json::from_slice(&data).ok()?;
    info.validate().ok()?;
    Some(info)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Signals
// ═══════════════════════════════════════════════════════════════════════════════

const SIGNAL_NAMES: &[(&str, i32)] = &[
    ("HUP", libc::SIGHUP),
    ("INT", libc::SIGINT),
    ("QUIT", libc::SIGQUIT),
    ("USR1", libc::SIGUSR1),
    ("USR2", libc::SIGUSR2),
    ("TERM", libc::SIGTERM),
    ("ALRM", libc::SIGALRM),
    ("CONT", libc::SIGCONT),
    ("WINCH", libc::SIGWINCH),
];

fn max_signal() -> i32 {
    #[cfg(target_os = "linux")]
    {
        libc::SIGRTMAX()
    }
    #[cfg(not(target_os = "linux"))]
    {
        31
    }
}

/// Parses `INT`, `SIGINT`, `sigusr1` or a plain number.
pub fn parse_signal(value: &str) -> Result<i32, String> {
    let trimmed = value.trim();
    if let Ok(number) = trimmed.parse::<i32>() {
        if (1..=max_signal()).contains(&number) {
            return Ok(number);
        }
        return Err(format!("signal number {} is out of range", number));
    }

    let upper = trimmed.to_ascii_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    SIGNAL_NAMES
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, number)| *number)
        .ok_or_else(|| format!("unknown signal {}", value))
}

/// Renders a signal as `SIGINT`, or `signal 34` when it has no common name.
pub fn signal_name(signal: i32) -> String {
    SIGNAL_NAMES
        .iter()
        .find(|(_, number)| *number == signal)
        .map(|(name, _)| format!("SIG{}", name))
        .unwrap_or_else(|| format!("signal {}", signal))
}
