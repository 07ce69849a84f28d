//! Line relay between the operator and a debugging session.
//!
//! The server speaks first. After each server chunk the operator supplies one
//! line, which is sent with a trailing newline. A chunk that fills the read
//! buffer is followed by another read before prompting.

use hotattach_protocol::{READ_CHUNK_SIZE, SESSION_END_PREFIX};
use std::io::{self, BufRead, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The target closed the session.
    ServerClosed,
    /// The operator's input ended first.
    OperatorEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub outcome: RelayOutcome,
    pub bytes_received: u64,
}

impl RelayReport {
    /// True when the target hung up before sending anything, which is how a
    /// queued connection that was never admitted ends.
    pub fn closed_before_output(&self) -> bool {
        self.outcome == RelayOutcome::ServerClosed && self.bytes_received == 0
    }
}

/// Streams that can stop sending while still reading.
pub trait SessionStream: Read + Write {
    fn finish_sending(&self) -> io::Result<()>;
}

impl SessionStream for UnixStream {
    fn finish_sending(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

impl SessionStream for TcpStream {
    fn finish_sending(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

pub fn relay<S: SessionStream>(
    stream: &mut S,
    operator: &mut dyn BufRead,
    display: &mut dyn Write,
) -> io::Result<RelayReport> {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    let mut received: u64 = 0;

    loop {
        let n = match stream.read(&mut buf) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if is_hangup(&err) => 0,
            Err(err) => return Err(err),
        };
        if n == 0 {
            return Ok(RelayReport {
                outcome: RelayOutcome::ServerClosed,
                bytes_received: received,
            });
        }
        received += n as u64;

        let chunk = &buf[..n];
        display.write_all(chunk)?;
        display.flush()?;

        if n == buf.len() || contains(chunk, SESSION_END_PREFIX.as_bytes()) {
            continue;
        }

        let mut line = String::new();
        if operator.read_line(&mut line)? == 0 {
            let _ = stream.finish_sending();
            return Ok(RelayReport {
                outcome: RelayOutcome::OperatorEof,
                bytes_received: received,
            });
        }
        let line = line.trim_end_matches(['\n', '\r']);
        let mut message = Vec::with_capacity(line.len() + 1);
        message.extend_from_slice(line.as_bytes());
        message.push(b'\n');

        if let Err(err) = stream.write_all(&message).and_then(|()| stream.flush()) {
            if is_hangup(&err) {
                return Ok(RelayReport {
                    outcome: RelayOutcome::ServerClosed,
                    bytes_received: received,
                });
            }
            return Err(err);
        }
    }
}

fn is_hangup(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted
    )
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
