//! Process liveness and signal delivery.

use hotattach_protocol::ProcessId;
use std::io;

/// The two process operations the attach flow needs. Tests substitute a fake.
pub trait ProcessControl {
    fn is_alive(&self, pid: ProcessId) -> bool;
    fn send_signal(&self, pid: ProcessId, signal: i32) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcess;

impl ProcessControl for SystemProcess {
    fn is_alive(&self, pid: ProcessId) -> bool {
        // SAFETY: kill with signal 0 only performs the existence and
        // permission check.
        let result = unsafe { libc::kill(pid.as_raw(), 0) };
        if result == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to someone else.
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn send_signal(&self, pid: ProcessId, signal: i32) -> io::Result<()> {
        // SAFETY: plain kill(2) on a positive pid.
        if unsafe { libc::kill(pid.as_raw(), signal) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(SystemProcess.is_alive(ProcessId::current()));
    }

    #[test]
    fn reaped_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = ProcessId::new(child.id()).unwrap();
        child.wait().unwrap();
        assert!(!SystemProcess.is_alive(pid));
    }

    #[test]
    fn signal_zero_to_self_succeeds() {
        assert!(SystemProcess.send_signal(ProcessId::current(), 0).is_ok());
    }
}
