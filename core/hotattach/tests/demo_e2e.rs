use hotattach_cli::{AttachConfig, Attacher};
use hotattach_protocol::{AttachPaths, ProcessId};
use std::io::{BufRead, BufReader, Cursor};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct DemoGuard {
    child: Child,
}

impl Drop for DemoGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawns the demo and waits for its `PID <n>` line.
fn spawn_demo(runtime_dir: &Path, args: &[&str]) -> (DemoGuard, ProcessId) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_hotattach-demo"))
        .arg("--runtime-dir")
        .arg(runtime_dir)
        .args(args)
        .env_remove("HOTATTACH_SIGNAL")
        .env_remove("HOTATTACH_MODE")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn hotattach-demo");

    let stdout = child.stdout.take().expect("demo stdout");
    let mut line = String::new();
    BufReader::new(stdout)
        .read_line(&mut line)
        .expect("Failed to read demo pid line");
    let pid = line
        .trim()
        .strip_prefix("PID ")
        .and_then(|raw| raw.parse::<ProcessId>().ok())
        .unwrap_or_else(|| panic!("unexpected demo output {line:?}"));
    assert_eq!(pid.get(), child.id());

    (DemoGuard { child }, pid)
}

fn attacher(runtime_dir: &Path) -> Attacher {
    Attacher::new(AttachConfig {
        runtime_dir: runtime_dir.to_path_buf(),
        poll_interval: Duration::from_millis(25),
        max_attempts: 200,
        ..AttachConfig::default()
    })
}

fn wait_for_path(path: &Path, present: bool, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() == present {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!(
        "Timed out waiting for {} to be {}",
        path.display(),
        if present { "created" } else { "removed" }
    );
}

fn wait_for_exit(guard: &mut DemoGuard, timeout: Duration) -> std::process::ExitStatus {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = guard.child.try_wait().expect("Failed to poll demo") {
            return status;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for demo to exit");
}

#[test]
fn proactive_attach_to_separate_process() {
    let dir = TempDir::new().unwrap();
    let (mut guard, pid) = spawn_demo(dir.path(), &[]);
    let paths = AttachPaths::new(dir.path(), pid);
    assert!(paths.marker.exists());
    assert!(!paths.transport.exists());

    let mut operator = Cursor::new(b"counter\ninfo\nquit\n".to_vec());
    let mut display = Vec::new();
    attacher(dir.path())
        .attach(pid, &mut operator, &mut display)
        .expect("attach to demo");
    let transcript = String::from_utf8(display).unwrap();

    assert!(
        transcript.contains(&format!("attached to PID {} (SIGINT)", pid)),
        "transcript: {transcript}"
    );
    assert!(transcript.contains("ticks="));
    assert!(transcript.contains(&format!("pid:        {}", pid)));

    wait_for_path(&paths.transport, false, Duration::from_secs(5));
    assert!(guard.child.try_wait().unwrap().is_none(), "SIGINT did not kill the demo");

    // Teardown on termination removes the marker.
    assert_eq!(unsafe { libc::kill(pid.as_raw(), libc::SIGTERM) }, 0);
    let status = wait_for_exit(&mut guard, Duration::from_secs(5));
    assert!(!status.success());
    assert!(!paths.marker.exists(), "marker removed on SIGTERM");
}

#[test]
fn reactive_panic_opens_session() {
    let dir = TempDir::new().unwrap();
    let (mut guard, pid) = spawn_demo(dir.path(), &["--reactive", "--panic-after", "0"]);
    let paths = AttachPaths::new(dir.path(), pid);
    assert!(!paths.marker.exists());

    wait_for_path(&paths.transport, true, Duration::from_secs(10));
    let mut operator = Cursor::new(b"where\nquit\n".to_vec());
    let mut display = Vec::new();
    attacher(dir.path())
        .attach(pid, &mut operator, &mut display)
        .expect("attach to panicking demo");
    let transcript = String::from_utf8(display).unwrap();

    assert!(transcript.contains("(panic at "), "transcript: {transcript}");
    assert!(transcript.contains("fault: demo panic after"));

    let status = wait_for_exit(&mut guard, Duration::from_secs(10));
    assert!(!status.success(), "panic still ends the process");
    assert!(!paths.transport.exists());
}

#[test]
fn engine_panic_during_fault_session_still_removes_transport() {
    let dir = TempDir::new().unwrap();
    let (mut guard, pid) = spawn_demo(dir.path(), &["--reactive", "--panic-after", "0"]);
    let paths = AttachPaths::new(dir.path(), pid);

    wait_for_path(&paths.transport, true, Duration::from_secs(10));
    let mut operator = Cursor::new(b"explode\nquit\n".to_vec());
    let mut display = Vec::new();
    attacher(dir.path())
        .attach(pid, &mut operator, &mut display)
        .expect("attach to panicking demo");
    let transcript = String::from_utf8(display).unwrap();

    assert!(
        transcript.contains("*** session ended: engine panicked: shell command exploded"),
        "transcript: {transcript}"
    );

    // The host panic keeps unwinding instead of aborting the process.
    let status = wait_for_exit(&mut guard, Duration::from_secs(10));
    assert_eq!(status.code(), Some(101), "status: {status:?}");
    assert!(!paths.transport.exists(), "transport left behind");
}

#[test]
fn clean_exit_removes_marker() {
    let dir = TempDir::new().unwrap();
    let (mut guard, pid) = spawn_demo(dir.path(), &["--run-for", "1"]);
    let paths = AttachPaths::new(dir.path(), pid);
    assert!(paths.marker.exists());

    let status = wait_for_exit(&mut guard, Duration::from_secs(10));
    assert!(status.success());
    assert!(!paths.marker.exists());
}

#[test]
fn unarmed_demo_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let (_guard, pid) = spawn_demo(dir.path(), &["--reactive"]);

    let err = attacher(dir.path())
        .connect(pid)
        .expect_err("reactive demo has no marker");
    assert!(matches!(err, hotattach_cli::AttachError::DebuggerUnavailable { .. }));
}
