//! One debugging session: an admitted connection handed to the engine.

use crate::engine::{ActivationContext, DebugEngine};
use crate::error::{EngineError, Result, TargetError};
use crate::fault::payload_message;
use crate::transport::Connection;
use hotattach_protocol::SESSION_END_PREFIX;
use std::io::{BufReader, Write};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The engine's interaction loop returned normally.
    Completed,
    /// The client closed its end while the engine was reading or writing.
    ClientDisconnected,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub duration: Duration,
}

/// Runs the engine until the session ends and closes the connection.
///
/// An engine error or panic is reported to the client as a final
/// `*** session ended: ...` line and returned as `EngineFailure`.
pub fn run(engine: &dyn DebugEngine, ctx: &ActivationContext, conn: Connection) -> Result<SessionReport> {
    let started = Instant::now();
    let reader = conn
        .try_clone()
        .map_err(|err| TargetError::io("clone session stream", err))?;
    let mut input = BufReader::new(reader);
    let mut output = conn;

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        engine.interact(ctx, &mut input, &mut output)
    }))
    .unwrap_or_else(|payload| Err(EngineError::Panicked(payload_message(payload.as_ref()))));

    let outcome = match result {
        Ok(()) => Ok(SessionOutcome::Completed),
        Err(err) if err.is_disconnect() => {
            debug!(error = %err, "Debug client disconnected");
            Ok(SessionOutcome::ClientDisconnected)
        }
        Err(err) => {
            let _ = writeln!(output, "{}: {}", SESSION_END_PREFIX, err);
            let _ = output.flush();
            Err(TargetError::EngineFailure(err))
        }
    };

    output.shutdown();
    outcome.map(|outcome| SessionReport {
        outcome,
        duration: started.elapsed(),
    })
}
