//! Fault boundaries that hand unrecovered failures to the debugger.
//!
//! Two entry points feed the activation state machine: a process-wide panic
//! hook, chained in front of whatever hook was installed before, and
//! [`run_guarded`] for errors that propagate up to `main`. In both cases the
//! fault is only observed: once the session ends the panic keeps unwinding
//! and the error is returned unchanged.

use crate::activation;
use crate::engine::{FaultInfo, FaultKind};
use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::panic;
use std::sync::Once;
use std::thread;

const MAX_BACKTRACE_LEN: usize = 64 * 1024;

static PANIC_HOOK: Once = Once::new();

/// Installs the panic hook once per process. The previous hook still runs
/// first, so the usual panic report is printed before the session opens.
pub(crate) fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            previous(info);

            let fault = FaultInfo {
                kind: FaultKind::Panic,
                message: payload_message(info.payload()),
                location: info
                    .location()
                    .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column())),
                thread: thread::current().name().map(String::from),
                backtrace: Some(truncate(Backtrace::force_capture().to_string())),
            };
            activation::on_fault(fault);
        }));
    });
}

/// Top-level error boundary.
///
/// Runs `body`; if it returns `Err`, the calling thread waits for a debugging
/// session (when a debugger is initialized and idle) before the error is
/// handed back to the caller.
pub fn run_guarded<T, E, F>(body: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: fmt::Display + fmt::Debug,
{
    let result = body();
    if let Err(err) = &result {
        let fault = FaultInfo {
            kind: FaultKind::Error,
            message: err.to_string(),
            location: None,
            thread: thread::current().name().map(String::from),
            // Debug rendering keeps the source chain and any captured backtrace.
            backtrace: Some(truncate(format!("{:?}", err))),
        };
        activation::on_fault(fault);
    }
    result
}

pub(crate) fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_BACKTRACE_LEN {
        let mut cut = MAX_BACKTRACE_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... [truncated]");
    }
    text
}
