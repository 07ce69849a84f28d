//! Signal handler chain.
//!
//! A registry maps each signal to an ordered list of actions. The first
//! registration for a signal installs one dispatcher with `sigaction` and
//! records the disposition it replaced. On delivery the dispatcher runs the
//! actions in registration order and then the recorded previous handler with
//! the same `(signal, siginfo, ucontext)` arguments. A default or ignored
//! previous disposition is not invoked.
//!
//! Actions are keyed: installing a key that is already registered for the
//! signal replaces its action in place, so re-arming never stacks handlers.
//!
//! Actions run in signal context. They must only perform async-signal-safe
//! work (atomics, `write(2)`, `unlink(2)`, `sigaction(2)`, `raise(3)`).
//!
//! The dispatcher reads an immutable snapshot of the registry through an
//! atomic pointer. Writers serialize on a mutex, publish a new snapshot and
//! leak the superseded one, since a handler may still be reading it.

use libc::{c_int, c_void, siginfo_t};
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

pub type SignalAction = Arc<dyn Fn(&SignalContext) + Send + Sync>;

/// Arguments of one signal delivery, shared by every action and the previous handler.
pub struct SignalContext {
    signal: c_int,
    info: *mut siginfo_t,
    ucontext: *mut c_void,
    has_previous: bool,
}

impl SignalContext {
    pub fn signal(&self) -> i32 {
        self.signal
    }

    pub fn info(&self) -> *const siginfo_t {
        self.info
    }

    pub fn ucontext(&self) -> *const c_void {
        self.ucontext
    }

    /// True when a non-default handler runs after the registered actions.
    pub fn has_previous(&self) -> bool {
        self.has_previous
    }
}

#[derive(Clone)]
struct Slot {
    signal: c_int,
    previous: libc::sigaction,
    actions: Vec<(&'static str, SignalAction)>,
}

#[derive(Clone, Default)]
struct Registry {
    slots: Vec<Slot>,
}

static CURRENT: AtomicPtr<Registry> = AtomicPtr::new(ptr::null_mut());
static WRITER: Mutex<()> = Mutex::new(());

/// Registers `action` under `key` for `signal`.
pub fn install<F>(signal: i32, key: &'static str, action: F) -> io::Result<()>
where
    F: Fn(&SignalContext) + Send + Sync + 'static,
{
    if signal == libc::SIGKILL || signal == libc::SIGSTOP || signal <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("signal {} cannot be handled", signal),
        ));
    }

    let _guard = WRITER.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut registry = snapshot();
    let action: SignalAction = Arc::new(action);

    if let Some(slot) = registry.slots.iter_mut().find(|slot| slot.signal == signal) {
        match slot.actions.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = action,
            None => slot.actions.push((key, action)),
        }
        publish(registry);
        return Ok(());
    }

    // Publish the slot before the dispatcher goes live so no delivery is lost.
    let queried = query(signal)?;
    registry.slots.push(Slot {
        signal,
        previous: queried,
        actions: vec![(key, action)],
    });
    publish(registry.clone());

    let replaced = match swap_in_dispatcher(signal) {
        Ok(replaced) => replaced,
        Err(err) => {
            registry.slots.retain(|slot| slot.signal != signal);
            publish(registry);
            return Err(err);
        }
    };

    if replaced.sa_sigaction != queried.sa_sigaction || replaced.sa_flags != queried.sa_flags {
        if let Some(slot) = registry.slots.iter_mut().find(|slot| slot.signal == signal) {
            slot.previous = replaced;
        }
        publish(registry);
    }

    Ok(())
}

/// Removes the action registered under `key`. When it was the last action
/// for `signal`, the previous disposition is restored. Returns whether an
/// action was removed.
pub fn uninstall(signal: i32, key: &'static str) -> io::Result<bool> {
    let _guard = WRITER.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut registry = snapshot();

    let Some(index) = registry.slots.iter().position(|slot| slot.signal == signal) else {
        return Ok(false);
    };

    let slot = &mut registry.slots[index];
    let before = slot.actions.len();
    slot.actions.retain(|(existing, _)| *existing != key);
    if slot.actions.len() == before {
        return Ok(false);
    }

    if slot.actions.is_empty() {
        let previous = slot.previous;
        // SAFETY: `previous` is a disposition previously returned by sigaction
        // for this signal.
        if unsafe { libc::sigaction(signal, &previous, ptr::null_mut()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        registry.slots.remove(index);
    }

    publish(registry);
    Ok(true)
}

/// Keys registered for `signal`, in dispatch order.
pub fn registered(signal: i32) -> Vec<&'static str> {
    let registry = snapshot();
    registry
        .slots
        .iter()
        .find(|slot| slot.signal == signal)
        .map(|slot| slot.actions.iter().map(|(key, _)| *key).collect())
        .unwrap_or_default()
}

/// True when `signal` currently has its default disposition (no handler, not ignored).
pub fn has_default_disposition(signal: i32) -> io::Result<bool> {
    Ok(query(signal)?.sa_sigaction == libc::SIG_DFL)
}

/// Restores the default disposition and re-raises `signal`. Intended for use
/// from an action whose signal should still terminate the process; the signal
/// is delivered once the dispatcher returns.
pub fn terminate_with_default(signal: i32) {
    // SAFETY: sigaction and raise are async-signal-safe; the zeroed struct is
    // a valid SIG_DFL disposition with an empty mask.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signal, &action, ptr::null_mut());
        libc::raise(signal);
    }
}

fn snapshot() -> Registry {
    let current = CURRENT.load(Ordering::Acquire);
    if current.is_null() {
        return Registry::default();
    }
    // SAFETY: published registries are never freed.
    unsafe { (*current).clone() }
}

fn publish(registry: Registry) {
    let next = Box::into_raw(Box::new(registry));
    // Superseded snapshots are leaked; a handler may still be reading one.
    CURRENT.swap(next, Ordering::AcqRel);
}

fn query(signal: c_int) -> io::Result<libc::sigaction> {
    // SAFETY: a null new action only reads the current disposition.
    unsafe {
        let mut current: libc::sigaction = mem::zeroed();
        if libc::sigaction(signal, ptr::null(), &mut current) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(current)
    }
}

fn swap_in_dispatcher(signal: c_int) -> io::Result<libc::sigaction> {
    let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) = dispatch;
    // SAFETY: the action struct is fully initialized and `dispatch` has the
    // SA_SIGINFO signature.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);

        let mut replaced: libc::sigaction = mem::zeroed();
        if libc::sigaction(signal, &action, &mut replaced) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(replaced)
    }
}

fn is_callable(previous: &libc::sigaction) -> bool {
    let handler = previous.sa_sigaction;
    let own: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) = dispatch;
    handler != libc::SIG_DFL && handler != libc::SIG_IGN && handler != own as libc::sighandler_t
}

extern "C" fn dispatch(signal: c_int, info: *mut siginfo_t, ucontext: *mut c_void) {
    let saved_errno = errno::get();

    let current = CURRENT.load(Ordering::Acquire);
    if !current.is_null() {
        // SAFETY: published registries are never freed.
        let registry = unsafe { &*current };
        if let Some(slot) = registry.slots.iter().find(|slot| slot.signal == signal) {
            let has_previous = is_callable(&slot.previous);
            let ctx = SignalContext {
                signal,
                info,
                ucontext,
                has_previous,
            };
            for (_, action) in &slot.actions {
                action(&ctx);
            }
            if has_previous {
                // SAFETY: the previous handler was installed for this signal
                // with the recorded flags, so its signature matches.
                unsafe { call_previous(&slot.previous, signal, info, ucontext) };
            }
        }
    }

    errno::set(saved_errno);
}

unsafe fn call_previous(
    previous: &libc::sigaction,
    signal: c_int,
    info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
            mem::transmute(previous.sa_sigaction);
        handler(signal, info, ucontext);
    } else {
        let handler: extern "C" fn(c_int) = mem::transmute(previous.sa_sigaction);
        handler(signal);
    }
}

mod errno {
    use libc::c_int;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn location() -> *mut c_int {
        // SAFETY: always returns the calling thread's errno slot.
        unsafe { libc::__errno_location() }
    }

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    fn location() -> *mut c_int {
        // SAFETY: always returns the calling thread's errno slot.
        unsafe { libc::__error() }
    }

    pub(super) fn get() -> c_int {
        // SAFETY: the slot is valid for the lifetime of the thread.
        unsafe { *location() }
    }

    pub(super) fn set(value: c_int) {
        // SAFETY: the slot is valid for the lifetime of the thread.
        unsafe { *location() = value }
    }
}
