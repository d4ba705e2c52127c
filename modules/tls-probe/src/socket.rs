use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

const READ_CHUNK: usize = 16 * 1024;

/// Result of draining a readable socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Open,
    Closed,
    /// The read failed after bytes were appended; the connection is gone.
    Failed,
}

/// Non-blocking TCP socket with zero linger; dropping it resets the connection.
pub struct ProbeSocket {
    socket: Socket,
    peer: SocketAddrV4,
}

impl ProbeSocket {
    /// Starts a non-blocking connect. An in-progress connect is success; the
    /// outcome shows up later as writability or an error.
    pub fn connect(peer: SocketAddrV4) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_linger(Some(Duration::ZERO))?;
        socket.set_nodelay(true)?;
        match socket.connect(&SockAddr::from(peer)) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        Ok(ProbeSocket { socket, peer })
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    /// Pending connect error, if any (`SO_ERROR`).
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.socket.take_error()
    }

    /// Appends everything currently readable to `buf`. An error that follows
    /// data (a reset after an alert) keeps the data and reports `Failed`.
    pub fn read_available(&self, buf: &mut Vec<u8>) -> io::Result<ReadStatus> {
        let mut chunk = [0u8; READ_CHUNK];
        let before = buf.len();
        loop {
            match (&self.socket).read(&mut chunk) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadStatus::Open),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) if buf.len() > before => return Ok(ReadStatus::Failed),
                Err(e) => return Err(e),
            }
        }
    }

    /// Single write attempt. Returns whether every byte was accepted; the
    /// handshake flights are small enough to fit a fresh send buffer.
    pub fn send(&self, bytes: &[u8]) -> io::Result<bool> {
        let n = (&self.socket).write(bytes)?;
        Ok(n == bytes.len())
    }
}

impl AsRawFd for ProbeSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
