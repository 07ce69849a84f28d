//! hotattach: attach an interactive debugging session to a running process.
//!
//! A target process arms the debugger once at startup:
//!
//! ```no_run
//! use hotattach::{Debugger, DebuggerConfig};
//!
//! let debugger = Debugger::init(DebuggerConfig::from_env()).expect("arm debugger");
//! // ... host work ...
//! debugger.shutdown().expect("disarm debugger");
//! ```
//!
//! In proactive mode a readiness marker `{runtime-dir}/{pid}.dbg-enabled` is
//! published and the activation signal (SIGINT by default) opens a one-client
//! socket at `{runtime-dir}/{pid}-debug-socket`. The `hotattach` client binary
//! performs the signal-and-connect handshake. In reactive mode only faults (a
//! panic, or an error reaching [`run_guarded`]) open a session.
//!
//! ## Modules
//!
//! - [`signals`]: keyed signal handler chain that preserves prior handlers
//! - [`activation`]: state machine and the [`Debugger`] handle
//! - [`transport`] and [`gate`]: session socket and single-client admission
//! - [`session`], [`engine`], [`shell`]: the engine contract and the built-in shell

pub mod activation;
pub mod config;
pub mod engine;
pub mod error;
pub mod fault;
pub mod gate;
pub mod logging;
pub mod session;
pub mod shell;
pub mod signals;
pub mod transport;

pub use activation::{state, Debugger, State};
pub use config::{DebuggerConfig, Mode, TransportKind};
pub use engine::{ActivationContext, DebugEngine, FaultInfo, FaultKind, Trigger};
pub use error::{EngineError, Result, TargetError};
pub use fault::run_guarded;
pub use hotattach_protocol::{AttachPaths, MarkerInfo, ProcessId};
pub use shell::InspectShell;

/// Arms the debugger in `mode` with every other setting taken from the
/// environment.
pub fn init(mode: Mode) -> Result<Debugger> {
    let config = DebuggerConfig::from_env();
    let config = match mode {
        Mode::Proactive => config.proactive(),
        Mode::Reactive => config.reactive(),
    };
    Debugger::init(config)
}
