//! Attach flow: probe, signal, poll, connect, relay.

use crate::config::AttachConfig;
use crate::error::{AttachError, Result};
use crate::probe::{ProcessControl, SystemProcess};
use crate::relay::{relay, RelayReport, SessionStream};
use fs_err as fs;
use hotattach_protocol::{read_marker, signal_name, AttachPaths, ProcessId};
use std::io::{self, BufRead, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportState {
    Missing,
    Socket,
    NotSocket,
}

pub struct Attacher<P = SystemProcess> {
    config: AttachConfig,
    process: P,
}

impl Attacher<SystemProcess> {
    pub fn new(config: AttachConfig) -> Self {
        Self {
            config,
            process: SystemProcess,
        }
    }
}

impl<P: ProcessControl> Attacher<P> {
    pub fn with_process(config: AttachConfig, process: P) -> Self {
        Self { config, process }
    }

    pub fn config(&self) -> &AttachConfig {
        &self.config
    }

    /// Validates a raw pid from the command line. Zero and values beyond
    /// `pid_t` can never name a live process.
    pub fn resolve(&self, raw: u32) -> Result<ProcessId> {
        let pid = ProcessId::new(raw).ok_or(AttachError::NoSuchProcess { pid: raw })?;
        if !self.process.is_alive(pid) {
            return Err(AttachError::NoSuchProcess { pid: raw });
        }
        Ok(pid)
    }

    /// Connects to the target's debug socket, activating the target first
    /// when it is armed but not serving.
    pub fn connect(&self, pid: ProcessId) -> Result<UnixStream> {
        if !self.process.is_alive(pid) {
            return Err(AttachError::NoSuchProcess { pid: pid.get() });
        }

        let paths = AttachPaths::new(&self.config.runtime_dir, pid);
        match inspect(&paths.transport, pid)? {
            TransportState::Socket => {}
            TransportState::NotSocket => return Err(corrupt(pid, &paths)),
            TransportState::Missing => self.activate(pid, &paths)?,
        }

        let target = format!("PID {}", pid);
        UnixStream::connect(&paths.transport).map_err(|err| match err.kind() {
            io::ErrorKind::ConnectionRefused => AttachError::ConnectionRefused { target },
            _ => AttachError::io(target, "connect to debug socket", err),
        })
    }

    /// Connects and relays the session between `operator` and `display`.
    pub fn attach(
        &self,
        pid: ProcessId,
        operator: &mut dyn BufRead,
        display: &mut dyn Write,
    ) -> Result<RelayReport> {
        let mut stream = self.connect(pid)?;
        info!(pid = %pid, "Connected to debug socket");
        run_relay(&mut stream, format!("PID {}", pid), operator, display)
    }

    fn activate(&self, pid: ProcessId, paths: &AttachPaths) -> Result<()> {
        if !paths.marker.exists() {
            return Err(AttachError::DebuggerUnavailable { pid });
        }

        let signal = read_marker(&paths.marker)
            .filter(|marker| marker.pid == pid)
            .map(|marker| marker.signal)
            .unwrap_or(self.config.signal);
        debug!(pid = %pid, signal = %signal_name(signal), "Sending activation signal");

        self.process
            .send_signal(pid, signal)
            .map_err(|err| match err.raw_os_error() {
                Some(libc::ESRCH) => AttachError::NoSuchProcess { pid: pid.get() },
                _ => AttachError::io(format!("PID {}", pid), "send activation signal", err),
            })?;

        for attempt in 1..=self.config.max_attempts {
            thread::sleep(self.config.poll_interval);
            match inspect(&paths.transport, pid)? {
                TransportState::Socket => {
                    debug!(pid = %pid, attempt, "Debug socket is ready");
                    return Ok(());
                }
                TransportState::NotSocket => return Err(corrupt(pid, paths)),
                TransportState::Missing => {
                    if !self.process.is_alive(pid) {
                        return Err(AttachError::NoSuchProcess { pid: pid.get() });
                    }
                }
            }
        }

        Err(AttachError::AttachTimeout {
            pid,
            attempts: self.config.max_attempts,
        })
    }
}

/// Attaches to a target that serves over TCP. No pid handshake is involved.
pub fn attach_tcp(
    addr: SocketAddr,
    operator: &mut dyn BufRead,
    display: &mut dyn Write,
) -> Result<RelayReport> {
    let target = addr.to_string();
    let mut stream = TcpStream::connect(addr).map_err(|err| match err.kind() {
        io::ErrorKind::ConnectionRefused => AttachError::ConnectionRefused {
            target: target.clone(),
        },
        _ => AttachError::io(&target, "connect", err),
    })?;
    info!(address = %addr, "Connected to debug listener");
    run_relay(&mut stream, target, operator, display)
}

fn run_relay<S: SessionStream>(
    stream: &mut S,
    target: String,
    operator: &mut dyn BufRead,
    display: &mut dyn Write,
) -> Result<RelayReport> {
    let report =
        relay(stream, operator, display).map_err(|err| AttachError::io(&target, "relay session", err))?;
    if report.closed_before_output() {
        return Err(AttachError::ConnectionRefused { target });
    }
    Ok(report)
}

fn inspect(path: &Path, pid: ProcessId) -> Result<TransportState> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => Ok(TransportState::Socket),
        Ok(_) => Ok(TransportState::NotSocket),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(TransportState::Missing),
        Err(err) => Err(AttachError::io(format!("PID {}", pid), "inspect debug socket", err)),
    }
}

fn corrupt(pid: ProcessId, paths: &AttachPaths) -> AttachError {
    AttachError::CorruptTransport {
        pid,
        path: paths.transport.clone(),
    }
}
