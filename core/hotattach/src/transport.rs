//! Session transport: one listening endpoint per activation.
//!
//! A Unix transport owns its socket file from `open` until `close`. The file
//! is removed on every exit path: explicit `close`, drop after an error, and
//! drop while unwinding from a panicking engine.

use crate::config::TransportKind;
use crate::error::{Result, TargetError};
use fs_err as fs;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Address a transport is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddress {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddress::Unix(path) => write!(f, "{}", path.display()),
            TransportAddress::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// Duplex byte stream of an admitted client.
#[derive(Debug)]
pub enum Connection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Connection {
    pub fn try_clone(&self) -> io::Result<Connection> {
        match self {
            Connection::Unix(stream) => stream.try_clone().map(Connection::Unix),
            Connection::Tcp(stream) => stream.try_clone().map(Connection::Tcp),
        }
    }

    pub fn shutdown(&self) {
        let _ = match self {
            Connection::Unix(stream) => stream.shutdown(std::net::Shutdown::Both),
            Connection::Tcp(stream) => stream.shutdown(std::net::Shutdown::Both),
        };
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Unix(stream) => stream.read(buf),
            Connection::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Unix(stream) => stream.write(buf),
            Connection::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Unix(stream) => stream.flush(),
            Connection::Tcp(stream) => stream.flush(),
        }
    }
}

pub struct SessionTransport {
    listener: Option<Listener>,
    address: TransportAddress,
    closed: bool,
}

impl SessionTransport {
    /// Opens the transport described by `kind`; `unix_path` is used for Unix transports.
    pub fn open(kind: &TransportKind, unix_path: &Path) -> Result<Self> {
        match kind {
            TransportKind::Unix => Self::open_unix(unix_path),
            TransportKind::Tcp { port, local } => Self::open_tcp(*port, *local),
        }
    }

    /// Binds a Unix stream socket at `path` with owner-only permissions.
    ///
    /// Anything already present at `path` is reported as `AddressInUse`; the
    /// existence check and the bind are not atomic.
    pub fn open_unix(path: &Path) -> Result<Self> {
        let address = path.display().to_string();

        if fs::symlink_metadata(path).is_ok() {
            return Err(TargetError::AddressInUse(address));
        }

        let listener = UnixListener::bind(path).map_err(|err| map_bind_error(&address, err))?;

        if let Err(err) = fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
            drop(listener);
            let _ = fs::remove_file(path);
            return Err(map_bind_error(&address, err));
        }

        debug!(path = %address, "Session transport bound");
        Ok(Self {
            listener: Some(Listener::Unix(listener)),
            address: TransportAddress::Unix(path.to_path_buf()),
            closed: false,
        })
    }

    pub fn open_tcp(port: u16, local: bool) -> Result<Self> {
        let host = if local {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        let requested = SocketAddr::from((host, port));
        let listener = TcpListener::bind(requested)
            .map_err(|err| map_bind_error(&requested.to_string(), err))?;
        let bound = listener
            .local_addr()
            .map_err(|err| TargetError::io("read bound TCP address", err))?;

        debug!(addr = %bound, "Session transport bound");
        Ok(Self {
            listener: Some(Listener::Tcp(listener)),
            address: TransportAddress::Tcp(bound),
            closed: false,
        })
    }

    pub fn address(&self) -> &TransportAddress {
        &self.address
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Blocks until one peer connects.
    pub fn accept(&mut self) -> Result<Connection> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| TargetError::TransportClosed(self.address.to_string()))?;

        match listener {
            Listener::Unix(listener) => listener
                .accept()
                .map(|(stream, _)| Connection::Unix(stream))
                .map_err(|err| TargetError::io("accept debug client", err)),
            Listener::Tcp(listener) => {
                let (stream, peer) = listener
                    .accept()
                    .map_err(|err| TargetError::io("accept debug client", err))?;
                let _ = stream.set_nodelay(true);
                debug!(peer = %peer, "TCP debug client connected");
                Ok(Connection::Tcp(stream))
            }
        }
    }

    /// Closes the listening socket but keeps the address file, so later
    /// connection attempts are refused by the kernel.
    pub fn stop_listening(&mut self) {
        self.listener = None;
    }

    /// Unbinds and removes the filesystem address.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.listener = None;

        if let TransportAddress::Unix(path) = &self.address {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Session transport removed"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "Failed to remove session transport")
                }
            }
        }
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        self.release();
    }
}

fn map_bind_error(address: &str, err: io::Error) -> TargetError {
    match err.kind() {
        io::ErrorKind::AddrInUse => TargetError::AddressInUse(address.to_string()),
        io::ErrorKind::PermissionDenied => TargetError::PermissionDenied {
            address: address.to_string(),
            source: err,
        },
        _ => TargetError::io(format!("bind {}", address), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn open_creates_owner_only_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1-debug-socket");

        let transport = SessionTransport::open_unix(&path).unwrap();
        let metadata = std::fs::metadata(&path).unwrap();
        assert!(metadata.file_type().is_socket());
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);

        transport.close();
        assert!(!path.exists());
    }

    #[test]
    fn open_reports_address_in_use() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("2-debug-socket");
        std::fs::write(&path, b"").unwrap();

        let err = SessionTransport::open_unix(&path).err().unwrap();
        assert!(matches!(err, TargetError::AddressInUse(_)));
        assert!(path.exists(), "a foreign file must not be removed");
    }

    #[test]
    fn drop_removes_address() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3-debug-socket");
        {
            let _transport = SessionTransport::open_unix(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn accept_yields_duplex_stream() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("4-debug-socket");
        let mut transport = SessionTransport::open_unix(&path).unwrap();

        let client_path = path.clone();
        let client = thread::spawn(move || {
            let mut stream = UnixStream::connect(client_path).unwrap();
            stream.write_all(b"ping\n").unwrap();
            let mut reply = [0u8; 5];
            stream.read_exact(&mut reply).unwrap();
            reply
        });

        let mut conn = transport.accept().unwrap();
        let mut request = [0u8; 5];
        conn.read_exact(&mut request).unwrap();
        assert_eq!(&request, b"ping\n");
        conn.write_all(b"pong\n").unwrap();

        assert_eq!(&client.join().unwrap(), b"pong\n");
    }

    #[test]
    fn tcp_transport_binds_loopback() {
        let transport = SessionTransport::open_tcp(0, true).unwrap();
        match transport.address() {
            TransportAddress::Tcp(addr) => {
                assert!(addr.ip().is_loopback());
                assert_ne!(addr.port(), 0);
            }
            other => panic!("unexpected address {other}"),
        }
    }
}
