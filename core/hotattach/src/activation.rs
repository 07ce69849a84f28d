//! Activation state machine.
//!
//! ```text
//! Uninitialized ──init──▶ Idle ──signal/fault──▶ Activating ──bind──▶ Serving
//!       ▲                  ▲                                             │
//!       └────shutdown──────┴──────────────── session ends ───────────────┘
//! ```
//!
//! The state is a process-wide atomic so a signal handler can perform the
//! `Idle -> Activating` transition with a single compare-and-swap. A fault or
//! signal that finds the machine in any other state is ignored, which is what
//! keeps a second transport from ever being opened.
//!
//! Signal-triggered activations never block inside the handler: the handler
//! writes one byte to a non-blocking socket pair and the activation thread
//! does the binding and serving. Fault-triggered activations block the
//! faulting thread while a helper thread serves the session.

use crate::config::{DebuggerConfig, Mode};
use crate::engine::{DebugEngine, FaultInfo, Trigger};
use crate::error::{Result, TargetError};
use crate::gate::AdmissionGate;
use crate::session::{self, SessionReport};
use crate::shell::InspectShell;
use crate::signals::{self, SignalContext};
use crate::transport::SessionTransport;
use crate::fault;
use chrono::Utc;
use fs_err as fs;
use hotattach_protocol::{signal_name, write_marker, AttachPaths, MarkerInfo, ProcessId};
use libc::{c_char, c_void};
use std::ffi::CString;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Once, TryLockError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const ACTIVATION_KEY: &str = "hotattach-activate";
const TEARDOWN_KEY: &str = "hotattach-teardown";
const WAKE_STOP: u8 = 0;
const WAKE_ACTIVATE: u8 = 1;
const FAULT_SESSION_THREAD: &str = "hotattach-fault-session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Uninitialized = 0,
    Idle = 1,
    Activating = 2,
    Serving = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            1 => State::Idle,
            2 => State::Activating,
            3 => State::Serving,
            _ => State::Uninitialized,
        }
    }
}

/// Lock-free holder of a [`State`]; every transition is a compare-and-swap.
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(State::Uninitialized as u8))
    }

    pub fn get(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: State, to: State) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn arm(&self) -> bool {
        self.transition(State::Uninitialized, State::Idle)
    }

    /// Async-signal-safe.
    pub fn begin_activation(&self) -> bool {
        self.transition(State::Idle, State::Activating)
    }

    pub fn begin_serving(&self) -> bool {
        self.transition(State::Activating, State::Serving)
    }

    /// Leaves `Activating` or `Serving` for `next`.
    pub fn finish(&self, next: State) {
        let _ = self.transition(State::Activating, next) || self.transition(State::Serving, next);
    }

    pub fn disarm(&self) -> bool {
        self.transition(State::Idle, State::Uninitialized)
    }
}

static STATE: StateCell = StateCell::new();
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);
static ACTIVE: Mutex<Option<Arc<Inner>>> = Mutex::new(None);
static MARKER_CPATH: AtomicPtr<c_char> = AtomicPtr::new(ptr::null_mut());
static TRANSPORT_CPATH: AtomicPtr<c_char> = AtomicPtr::new(ptr::null_mut());
static EXIT_HOOK: Once = Once::new();

/// Current state of this process's debugger.
pub fn state() -> State {
    STATE.get()
}

struct Inner {
    config: DebuggerConfig,
    pid: ProcessId,
    paths: AttachPaths,
    engine: Arc<dyn DebugEngine>,
    wake_tx: Mutex<Option<UnixStream>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    teardown_signals: Mutex<Vec<i32>>,
    sessions: AtomicU64,
}

/// Handle to the debugger of this process. Created once by
/// [`Debugger::init`]; [`Debugger::shutdown`] removes the readiness marker and
/// the signal handlers again.
///
/// # Live process state
///
/// A signal-triggered session is served by the `hotattach-activation` thread.
/// The thread the signal interrupted is not suspended: the application keeps
/// running while the operator inspects it, so anything an engine reads may
/// change between two commands. Only faults hold their thread, and only that
/// one thread, until the session ends.
pub struct Debugger {
    inner: Arc<Inner>,
}

impl Debugger {
    /// Arms the debugger with the built-in inspection shell.
    pub fn init(config: DebuggerConfig) -> Result<Debugger> {
        Self::init_with_engine(config, Arc::new(InspectShell::new()))
    }

    pub fn init_with_engine(config: DebuggerConfig, engine: Arc<dyn DebugEngine>) -> Result<Debugger> {
        let mut active = lock_active();
        if active.is_some() || STATE.get() != State::Uninitialized {
            return Err(TargetError::AlreadyInitialized);
        }

        fs::create_dir_all(&config.runtime_dir)
            .map_err(|err| TargetError::io("create runtime directory", err))?;

        let pid = ProcessId::current();
        let paths = AttachPaths::new(&config.runtime_dir, pid);
        remove_leftover(&paths.transport, "transport");
        remove_leftover(&paths.marker, "readiness marker");

        let inner = Arc::new(Inner {
            config,
            pid,
            paths,
            engine,
            wake_tx: Mutex::new(None),
            worker: Mutex::new(None),
            teardown_signals: Mutex::new(Vec::new()),
            sessions: AtomicU64::new(0),
        });

        fault::install_panic_hook();
        install_exit_hook();

        if !STATE.arm() {
            return Err(TargetError::AlreadyInitialized);
        }
        *active = Some(Arc::clone(&inner));
        drop(active);

        if inner.config.mode == Mode::Proactive {
            if let Err(err) = inner.arm_proactive() {
                error!(error = %err, "Failed to arm debugger");
                inner.disarm();
                *lock_active() = None;
                STATE.disarm();
                return Err(err);
            }
        }

        info!(
            pid = %inner.pid,
            mode = ?inner.config.mode,
            signal = %signal_name(inner.config.signal),
            runtime_dir = %inner.config.runtime_dir.display(),
            "Debugger initialized"
        );
        Ok(Debugger { inner })
    }

    pub fn pid(&self) -> ProcessId {
        self.inner.pid
    }

    pub fn paths(&self) -> &AttachPaths {
        &self.inner.paths
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> State {
        STATE.get()
    }

    pub fn sessions_served(&self) -> u64 {
        self.inner.sessions.load(Ordering::Relaxed)
    }

    /// Serves one session on the calling thread, as if the host itself had
    /// faulted. Fails with `AlreadyActive` when a session is being set up or served.
    pub fn activate(&self) -> Result<SessionReport> {
        if !STATE.begin_activation() {
            return Err(TargetError::AlreadyActive);
        }
        self.inner.serve(Trigger::Requested)
    }

    /// Removes the readiness marker and the signal handlers and returns the
    /// process to `Uninitialized`. A session that is being served keeps
    /// running until its client leaves.
    pub fn shutdown(self) -> Result<()> {
        self.inner.disarm();
        *lock_active() = None;
        if !STATE.disarm() {
            debug!(state = ?STATE.get(), "Session still active; state settles when it ends");
        }
        info!(pid = %self.inner.pid, "Debugger shut down");
        Ok(())
    }
}

impl Inner {
    fn arm_proactive(self: &Arc<Self>) -> Result<()> {
        let signal = self.config.signal;

        let (tx, rx) =
            UnixStream::pair().map_err(|err| TargetError::io("create activation channel", err))?;
        tx.set_nonblocking(true)
            .map_err(|err| TargetError::io("configure activation channel", err))?;
        WAKE_FD.store(tx.as_raw_fd(), Ordering::Release);
        *lock(&self.wake_tx) = Some(tx);

        let worker = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("hotattach-activation".to_string())
            .spawn(move || worker.activation_loop(rx))
            .map_err(|err| TargetError::io("spawn activation thread", err))?;
        *lock(&self.worker) = Some(handle);

        signals::install(signal, ACTIVATION_KEY, on_activation_signal)
            .map_err(|source| TargetError::SignalInstall { signal, source })?;

        for &teardown in &self.config.teardown_signals {
            if teardown == signal {
                continue;
            }
            match signals::has_default_disposition(teardown) {
                Ok(true) => {
                    signals::install(teardown, TEARDOWN_KEY, on_termination_signal).map_err(
                        |source| TargetError::SignalInstall {
                            signal: teardown,
                            source,
                        },
                    )?;
                    lock(&self.teardown_signals).push(teardown);
                }
                Ok(false) => debug!(
                    signal = %signal_name(teardown),
                    "Signal has a custom disposition; leaving it to the host"
                ),
                Err(err) => warn!(error = %err, signal = teardown, "Failed to query signal disposition"),
            }
        }

        let marker = MarkerInfo::new(self.pid, signal, Utc::now());
        write_marker(&self.paths.marker, &marker)
            .map_err(|err| TargetError::io("create readiness marker", err))?;
        publish_path(&MARKER_CPATH, Some(&self.paths.marker));
        debug!(path = %self.paths.marker.display(), "Readiness marker created");
        Ok(())
    }

    fn disarm(&self) {
        if let Err(err) = signals::uninstall(self.config.signal, ACTIVATION_KEY) {
            warn!(error = %err, "Failed to remove activation handler");
        }
        for signal in lock(&self.teardown_signals).drain(..) {
            if let Err(err) = signals::uninstall(signal, TEARDOWN_KEY) {
                warn!(error = %err, signal, "Failed to remove teardown handler");
            }
        }

        WAKE_FD.store(-1, Ordering::Release);
        if let Some(mut tx) = lock(&self.wake_tx).take() {
            let _ = tx.write_all(&[WAKE_STOP]);
        }
        if let Some(handle) = lock(&self.worker).take() {
            if STATE.get() == State::Idle && handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        publish_path(&MARKER_CPATH, None);
        if self.config.mode == Mode::Proactive {
            match fs::remove_file(&self.paths.marker) {
                Ok(()) => debug!(path = %self.paths.marker.display(), "Readiness marker removed"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(error = %err, "Failed to remove readiness marker"),
            }
        }
    }

    fn activation_loop(&self, mut rx: UnixStream) {
        let mut byte = [0u8; 1];
        loop {
            match rx.read(&mut byte) {
                Ok(0) => break,
                Ok(_) if byte[0] == WAKE_STOP => break,
                Ok(_) => {
                    if STATE.get() != State::Activating {
                        continue;
                    }
                    let trigger = Trigger::Signal {
                        signal: self.config.signal,
                    };
                    if let Err(err) = self.serve(trigger) {
                        warn!(error = %err, "Signal-triggered session failed");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(error = %err, "Activation channel failed");
                    break;
                }
            }
        }
        debug!("Activation thread exiting");
    }

    /// Serves one session. The caller has already moved the state to `Activating`.
    fn serve(&self, trigger: Trigger) -> Result<SessionReport> {
        let _settle = SettleGuard;

        let transport = SessionTransport::open(&self.config.transport, &self.paths.transport)
            .map_err(|err| {
                error!(error = %err, "Failed to open session transport");
                err
            })?;
        let _published = PublishedTransport::new(&transport);
        STATE.begin_serving();
        info!(address = %transport.address(), trigger = %trigger, "Waiting for debug client");

        let mut gate = AdmissionGate::new(transport);
        let conn = gate.admit()?;

        let ctx = crate::engine::ActivationContext::new(trigger);
        let result = session::run(self.engine.as_ref(), &ctx, conn);
        gate.close();
        self.sessions.fetch_add(1, Ordering::Relaxed);

        match &result {
            Ok(report) => info!(
                outcome = ?report.outcome,
                duration_ms = report.duration.as_millis() as u64,
                "Debug session ended"
            ),
            Err(err) => warn!(error = %err, "Debug session ended with an error"),
        }
        result
    }
}

/// Entry point of the fault boundaries.
pub(crate) fn on_fault(fault: FaultInfo) {
    // The faulting thread may already hold the lock.
    let inner = match ACTIVE.try_lock() {
        Ok(active) => active.clone(),
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().clone(),
        Err(TryLockError::WouldBlock) => return,
    };
    let Some(inner) = inner else {
        return;
    };

    if !STATE.begin_activation() {
        warn!(message = %fault.message, "Fault observed while the debugger is busy; not serving another session");
        return;
    }
    // The faulting thread waits for the session. An engine panic has to
    // unwind on a thread of its own: inside the panic hook it would abort.
    let trigger = Trigger::Fault(fault);
    thread::scope(|scope| {
        let helper = thread::Builder::new()
            .name(FAULT_SESSION_THREAD.to_string())
            .spawn_scoped(scope, || inner.serve(trigger));
        match helper.map(|handle| handle.join()) {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(err))) => error!(error = %err, "Fault-triggered session failed"),
            Ok(Err(_)) => error!("Fault session thread panicked"),
            Err(err) => {
                let _settle = SettleGuard;
                error!(error = %err, "Failed to spawn fault session thread");
            }
        }
    });
}

/// Returns the state to `Idle` (or `Uninitialized` after shutdown) however
/// `serve` exits, including unwinding.
struct SettleGuard;

impl Drop for SettleGuard {
    fn drop(&mut self) {
        let armed = match ACTIVE.try_lock() {
            Ok(active) => active.is_some(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_some(),
            Err(TryLockError::WouldBlock) => true,
        };
        STATE.finish(if armed { State::Idle } else { State::Uninitialized });
    }
}

/// Exposes the transport path to the termination handlers while it exists.
struct PublishedTransport;

impl PublishedTransport {
    fn new(transport: &SessionTransport) -> Self {
        if let crate::transport::TransportAddress::Unix(path) = transport.address() {
            publish_path(&TRANSPORT_CPATH, Some(path));
        }
        PublishedTransport
    }
}

impl Drop for PublishedTransport {
    fn drop(&mut self) {
        publish_path(&TRANSPORT_CPATH, None);
    }
}

fn on_activation_signal(_ctx: &SignalContext) {
    if !STATE.begin_activation() {
        return;
    }
    let fd = WAKE_FD.load(Ordering::Acquire);
    let byte = WAKE_ACTIVATE;
    // SAFETY: write(2) is async-signal-safe; the fd is non-blocking and owned
    // by the armed debugger.
    let written = if fd >= 0 {
        unsafe { libc::write(fd, &byte as *const u8 as *const c_void, 1) }
    } else {
        -1
    };
    if written != 1 {
        STATE.finish(State::Idle);
    }
}

fn on_termination_signal(ctx: &SignalContext) {
    unlink_published();
    signals::terminate_with_default(ctx.signal());
}

extern "C" fn remove_on_exit() {
    unlink_published();
}

fn install_exit_hook() {
    EXIT_HOOK.call_once(|| {
        // SAFETY: registers a plain extern "C" function with no captured state.
        if unsafe { libc::atexit(remove_on_exit) } != 0 {
            warn!("Failed to register exit hook; readiness marker may outlive the process");
        }
    });
}

/// Async-signal-safe.
fn unlink_published() {
    for slot in [&MARKER_CPATH, &TRANSPORT_CPATH] {
        let path = slot.load(Ordering::Acquire);
        if !path.is_null() {
            // SAFETY: published paths are NUL-terminated and never freed.
            unsafe { libc::unlink(path) };
        }
    }
}

fn publish_path(slot: &AtomicPtr<c_char>, path: Option<&Path>) {
    let next = path
        .and_then(|path| CString::new(path.as_os_str().as_bytes()).ok())
        .map(CString::into_raw)
        .unwrap_or(ptr::null_mut());
    // The previous string is leaked; a handler may still be reading it.
    slot.swap(next, Ordering::AcqRel);
}

fn remove_leftover(path: &Path, what: &str) {
    match fs::remove_file(path) {
        Ok(()) => warn!(path = %path.display(), "Removed leftover {} from a previous process", what),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(error = %err, path = %path.display(), "Failed to remove leftover {}", what),
    }
}

fn lock_active() -> std::sync::MutexGuard<'static, Option<Arc<Inner>>> {
    ACTIVE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cell_walks_the_lifecycle() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), State::Uninitialized);
        assert!(!cell.begin_activation(), "cannot activate before init");

        assert!(cell.arm());
        assert!(!cell.arm());
        assert!(cell.begin_activation());
        assert!(!cell.begin_activation(), "second trigger is ignored");
        assert!(cell.begin_serving());
        assert!(!cell.begin_activation(), "no trigger while serving");

        cell.finish(State::Idle);
        assert_eq!(cell.get(), State::Idle);
        assert!(cell.disarm());
        assert_eq!(cell.get(), State::Uninitialized);
    }

    #[test]
    fn finish_is_a_no_op_when_idle() {
        let cell = StateCell::new();
        assert!(cell.arm());
        cell.finish(State::Uninitialized);
        assert_eq!(cell.get(), State::Idle);
    }
}
