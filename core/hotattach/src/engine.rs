//! Contract between the session server and a debugging engine.
//!
//! The server hands the engine a readable stream, a writable stream and the
//! context of the activation. The engine owns the command language; the
//! server only cares about when `interact` returns.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use hotattach_protocol::{signal_name, ProcessId};
use serde::Serialize;
use std::fmt;
use std::io::{BufRead, Write};

/// What started the session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// The activation signal reached the chained handler.
    Signal { signal: i32 },
    /// An unrecovered fault reached the fault boundary.
    Fault(FaultInfo),
    /// The host asked for a session directly.
    Requested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Panic,
    Error,
}

/// Captured state of an unrecovered fault.
#[derive(Debug, Clone, Serialize)]
pub struct FaultInfo {
    pub kind: FaultKind,
    pub message: String,
    pub location: Option<String>,
    pub thread: Option<String>,
    pub backtrace: Option<String>,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Signal { signal } => write!(f, "{}", signal_name(*signal)),
            Trigger::Fault(fault) => match (&fault.kind, &fault.location) {
                (FaultKind::Panic, Some(location)) => write!(f, "panic at {}", location),
                (FaultKind::Panic, None) => write!(f, "panic"),
                (FaultKind::Error, _) => write!(f, "unrecovered error"),
            },
            Trigger::Requested => write!(f, "host request"),
        }
    }
}

/// Everything an engine may inspect about the activation.
#[derive(Debug, Clone, Serialize)]
pub struct ActivationContext {
    pub pid: ProcessId,
    pub trigger: Trigger,
    pub activated_at: DateTime<Utc>,
    /// Thread that serves the session.
    pub thread: Option<String>,
}

impl ActivationContext {
    pub fn new(trigger: Trigger) -> Self {
        Self {
            pid: ProcessId::current(),
            trigger,
            activated_at: Utc::now(),
            thread: std::thread::current().name().map(String::from),
        }
    }

    pub fn fault(&self) -> Option<&FaultInfo> {
        match &self.trigger {
            Trigger::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

/// An interactive debugging engine.
///
/// `interact` returns when the session is over: the client sent a terminating
/// command or closed its end. Returning an error ends the session as an
/// engine failure.
pub trait DebugEngine: Send + Sync {
    fn interact(
        &self,
        ctx: &ActivationContext,
        input: &mut dyn BufRead,
        output: &mut dyn Write,
    ) -> Result<(), EngineError>;
}
