//! Client-side attach errors. Every message names the target.

use hotattach_protocol::ProcessId;
use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    // ─────────────────────────────────────────────────────────────────────
    // Availability
    // ─────────────────────────────────────────────────────────────────────
    #[error("Could not find process with PID {pid}, aborting.")]
    NoSuchProcess { pid: u32 },

    #[error("Debugger is not enabled in process with PID {pid} (no readiness marker).")]
    DebuggerUnavailable { pid: ProcessId },

    #[error("Process with PID {pid} did not open its debug socket after {attempts} attempts.")]
    AttachTimeout { pid: ProcessId, attempts: u32 },

    #[error("Debug socket of process with PID {pid} is not a socket: {path}")]
    CorruptTransport { pid: ProcessId, path: PathBuf },

    // ─────────────────────────────────────────────────────────────────────
    // Connection
    // ─────────────────────────────────────────────────────────────────────
    #[error("Connection to {target} refused: another client is already attached.")]
    ConnectionRefused { target: String },

    #[error("Permission denied while attaching to {target}: {source}")]
    PermissionDenied {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while attaching to {target}: {context}: {source}")]
    Io {
        target: String,
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl AttachError {
    pub(crate) fn io(target: impl ToString, context: &'static str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied => AttachError::PermissionDenied {
                target: target.to_string(),
                source,
            },
            _ => AttachError::Io {
                target: target.to_string(),
                context,
                source,
            },
        }
    }
}

pub type Result<T, E = AttachError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_pid() {
        let pid = ProcessId::new(4242).unwrap();
        let errors = [
            AttachError::NoSuchProcess { pid: 4242 }.to_string(),
            AttachError::DebuggerUnavailable { pid }.to_string(),
            AttachError::AttachTimeout { pid, attempts: 3 }.to_string(),
            AttachError::CorruptTransport {
                pid,
                path: PathBuf::from("/tmp/4242-debug-socket"),
            }
            .to_string(),
            AttachError::ConnectionRefused {
                target: "PID 4242".to_string(),
            }
            .to_string(),
        ];
        for message in errors {
            assert!(message.contains("4242"), "{message}");
        }
    }

    #[test]
    fn permission_errors_are_classified() {
        let err = AttachError::io(
            "PID 1",
            "connect",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, AttachError::PermissionDenied { .. }));
    }
}
