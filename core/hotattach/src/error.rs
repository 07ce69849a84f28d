//! Error types for the target side of hotattach.

use std::io;

// ═══════════════════════════════════════════════════════════════════════════════
// Engine Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure raised by a debugging engine while it owns the session streams.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("engine panicked: {0}")]
    Panicked(String),
}

impl EngineError {
    /// True when the error only means the client went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            EngineError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Target Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// All errors that can occur while arming a target or serving a session.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    // ─────────────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("transport address already in use: {0}")]
    AddressInUse(String),

    #[error("permission denied for {address}: {source}")]
    PermissionDenied {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("admission gate for {0} is already occupied")]
    GateOccupied(String),

    #[error("transport {0} is no longer listening")]
    TransportClosed(String),

    // ─────────────────────────────────────────────────────────────────────
    // Session Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("debugging engine failed: {0}")]
    EngineFailure(#[source] EngineError),

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("debugger is already initialized in this process")]
    AlreadyInitialized,

    #[error("debugger is already active; activation ignored")]
    AlreadyActive,

    #[error("failed to install handler for signal {signal}: {source}")]
    SignalInstall {
        signal: i32,
        #[source]
        source: io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl TargetError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        TargetError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = TargetError> = std::result::Result<T, E>;
