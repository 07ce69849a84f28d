use hotattach::{
    run_guarded, state, ActivationContext, DebugEngine, Debugger, DebuggerConfig, EngineError,
    State, TargetError,
};
use hotattach_cli::{AttachConfig, AttachError, Attacher, RelayOutcome};
use std::io::{BufRead, BufReader, Cursor, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, sleep};
use std::time::{Duration, Instant};
use tempfile::TempDir;

// One debugger per process: every test takes this lock.
static DEBUGGER_LOCK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    DEBUGGER_LOCK.lock().unwrap_or_else(|p| p.into_inner())
}

fn proactive(dir: &TempDir) -> DebuggerConfig {
    DebuggerConfig::default()
        .proactive()
        .with_signal(libc::SIGUSR1)
        .with_runtime_dir(dir.path())
        .with_teardown_signals(Vec::new())
}

fn attacher(dir: &TempDir) -> Attacher {
    Attacher::new(AttachConfig {
        runtime_dir: dir.path().to_path_buf(),
        signal: libc::SIGUSR1,
        poll_interval: Duration::from_millis(20),
        max_attempts: 250,
    })
}

fn wait_for_state(expected: State, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if state() == expected {
            return;
        }
        sleep(Duration::from_millis(10));
    }
    panic!("Timed out waiting for state {:?}, still {:?}", expected, state());
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        sleep(Duration::from_millis(10));
    }
    panic!("Timed out waiting for debug socket at {}", path.display());
}

struct Failing;

impl DebugEngine for Failing {
    fn interact(
        &self,
        _ctx: &ActivationContext,
        _input: &mut dyn BufRead,
        _output: &mut dyn Write,
    ) -> Result<(), EngineError> {
        Err(EngineError::Command {
            command: "eval".to_string(),
            message: "frame vanished".to_string(),
        })
    }
}

/// Reports admission, then echoes lines until `quit`.
struct Gatekeeper {
    admitted: Mutex<Sender<()>>,
}

impl DebugEngine for Gatekeeper {
    fn interact(
        &self,
        _ctx: &ActivationContext,
        input: &mut dyn BufRead,
        output: &mut dyn Write,
    ) -> Result<(), EngineError> {
        if let Ok(admitted) = self.admitted.lock() {
            let _ = admitted.send(());
        }
        output.write_all(b"ready> ")?;
        output.flush()?;
        let mut line = String::new();
        while input.read_line(&mut line)? > 0 {
            if line.trim() == "quit" {
                return Ok(());
            }
            output.write_all(format!("{}ready> ", line).as_bytes())?;
            output.flush()?;
            line.clear();
        }
        Ok(())
    }
}

#[test]
fn proactive_attach_to_own_process() {
    let _serial = serial();
    let dir = TempDir::new().unwrap();
    let debugger = Debugger::init(proactive(&dir)).unwrap();
    let paths = debugger.paths().clone();

    assert_eq!(debugger.state(), State::Idle);
    assert!(paths.marker.exists(), "marker published when armed");
    assert!(!paths.transport.exists(), "no transport before activation");

    let mut operator = Cursor::new(b"info\nquit\n".to_vec());
    let mut display = Vec::new();
    let report = attacher(&dir)
        .attach(debugger.pid(), &mut operator, &mut display)
        .unwrap();
    let transcript = String::from_utf8(display).unwrap();

    assert_eq!(report.outcome, RelayOutcome::ServerClosed);
    assert!(
        transcript.contains(&format!("attached to PID {} (SIGUSR1)", debugger.pid())),
        "transcript: {transcript}"
    );
    assert!(transcript.contains(&format!("pid:        {}", debugger.pid())));

    wait_for_state(State::Idle, Duration::from_secs(5));
    assert!(!paths.transport.exists(), "transport removed after the session");
    assert_eq!(debugger.sessions_served(), 1);

    debugger.shutdown().unwrap();
    assert!(!paths.marker.exists(), "marker removed on shutdown");
    assert_eq!(state(), State::Uninitialized);
}

#[test]
fn engine_failure_ends_session_and_removes_transport() {
    let _serial = serial();
    let dir = TempDir::new().unwrap();
    let debugger = Debugger::init_with_engine(proactive(&dir), Arc::new(Failing)).unwrap();
    let transport = debugger.paths().transport.clone();

    let mut operator = Cursor::new(Vec::new());
    let mut display = Vec::new();
    let report = attacher(&dir)
        .attach(debugger.pid(), &mut operator, &mut display)
        .unwrap();
    let transcript = String::from_utf8(display).unwrap();

    assert_eq!(report.outcome, RelayOutcome::ServerClosed);
    assert_eq!(
        transcript.trim_end(),
        "*** session ended: command `eval` failed: frame vanished"
    );

    wait_for_state(State::Idle, Duration::from_secs(5));
    assert!(!transport.exists());
    debugger.shutdown().unwrap();
}

#[test]
fn second_concurrent_client_is_refused() {
    let _serial = serial();
    let dir = TempDir::new().unwrap();
    let (admitted_tx, admitted_rx) = mpsc::channel();
    let engine = Gatekeeper {
        admitted: Mutex::new(admitted_tx),
    };
    let debugger = Debugger::init_with_engine(proactive(&dir), Arc::new(engine)).unwrap();
    let pid = debugger.pid();

    let (mut operator_tx, operator_rx) = UnixStream::pair().unwrap();
    let first_attacher = attacher(&dir);
    let first = thread::spawn(move || {
        let mut operator = BufReader::new(operator_rx);
        let mut display = Vec::new();
        let result = first_attacher.attach(pid, &mut operator, &mut display);
        (result, String::from_utf8(display).unwrap())
    });

    admitted_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("first client admitted");

    match attacher(&dir).connect(pid) {
        Err(AttachError::ConnectionRefused { target }) => {
            assert!(target.contains(&pid.to_string()))
        }
        other => panic!("second client should be refused, got {other:?}"),
    }

    operator_tx.write_all(b"hello\nquit\n").unwrap();
    let (result, transcript) = first.join().unwrap();
    assert_eq!(result.unwrap().outcome, RelayOutcome::ServerClosed);
    assert_eq!(transcript, "ready> hello\nready> ");

    // The gate reopens with the next activation.
    wait_for_state(State::Idle, Duration::from_secs(5));
    let mut operator = Cursor::new(b"quit\n".to_vec());
    let report = attacher(&dir)
        .attach(pid, &mut operator, &mut Vec::new())
        .unwrap();
    assert_eq!(report.outcome, RelayOutcome::ServerClosed);

    wait_for_state(State::Idle, Duration::from_secs(5));
    assert_eq!(debugger.sessions_served(), 2);
    debugger.shutdown().unwrap();
}

#[test]
fn guarded_error_holds_faulting_thread_for_a_session() {
    let _serial = serial();
    let dir = TempDir::new().unwrap();
    let config = proactive(&dir).reactive();
    let debugger = Debugger::init(config).unwrap();
    let paths = debugger.paths().clone();
    assert!(!paths.marker.exists(), "reactive mode publishes no marker");

    let worker = thread::Builder::new()
        .name("faulty-worker".to_string())
        .spawn(|| run_guarded(|| -> Result<(), String> { Err("disk on fire".to_string()) }))
        .unwrap();

    wait_for_socket(&paths.transport, Duration::from_secs(5));
    let mut operator = Cursor::new(b"where\nquit\n".to_vec());
    let mut display = Vec::new();
    attacher(&dir)
        .attach(debugger.pid(), &mut operator, &mut display)
        .unwrap();
    let transcript = String::from_utf8(display).unwrap();

    assert!(transcript.contains("(unrecovered error)"), "transcript: {transcript}");
    assert!(transcript.contains("fault: disk on fire"));
    assert!(transcript.contains("in:    faulty-worker"));

    let result = worker.join().unwrap();
    assert_eq!(result, Err("disk on fire".to_string()), "error returned unchanged");
    wait_for_state(State::Idle, Duration::from_secs(5));
    assert!(!paths.transport.exists());
    debugger.shutdown().unwrap();
}

#[test]
fn lifecycle_errors() {
    let _serial = serial();
    let dir = TempDir::new().unwrap();
    let debugger = Debugger::init(proactive(&dir)).unwrap();

    assert!(matches!(
        Debugger::init(proactive(&dir)),
        Err(TargetError::AlreadyInitialized)
    ));

    debugger.shutdown().unwrap();
    assert_eq!(state(), State::Uninitialized);

    let again = Debugger::init(proactive(&dir)).unwrap();
    again.shutdown().unwrap();
}

#[test]
fn leftover_files_from_previous_process_are_replaced() {
    let _serial = serial();
    let dir = TempDir::new().unwrap();
    let paths = hotattach::AttachPaths::new(dir.path(), hotattach::ProcessId::current());
    std::fs::write(&paths.transport, b"stale").unwrap();

    let debugger = Debugger::init(proactive(&dir)).unwrap();
    assert!(!paths.transport.exists());
    assert!(paths.marker.exists());
    debugger.shutdown().unwrap();
}
