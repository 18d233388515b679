//! TCP wire primitives: listener setup, polled accept, timed reads and writes.
//!
//! The listening socket is built with [`socket2`] so `SO_REUSEADDR` can be set
//! before `bind`, then converted into a [`std::net::TcpListener`]. Ownership
//! of a descriptor follows Rust move semantics: a [`Stream`] is owned by
//! exactly one connection task and the descriptor closes when it drops.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

/// Errors produced while setting up the listening socket.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of a single [`Stream::recv`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// `n` bytes were read into the buffer.
    Data(usize),
    /// The peer performed an orderly shutdown.
    Eof,
    /// The receive timeout elapsed before any data arrived.
    TimedOut,
}

/// A bound, listening TCP socket owned by the server loop.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Creates the socket, sets `SO_REUSEADDR`, binds `host:port`, and
    /// listens with `backlog`.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Bind`] for any failure along the way; bind/listen
    /// failures are fatal to the caller.
    pub fn bind(host: &str, port: u16, backlog: i32) -> Result<Self, NetError> {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| NetError::Bind {
                addr: format!("{host}:{port}"),
                source: io::Error::new(io::ErrorKind::InvalidInput, format!("{e}")),
            })?;
        let bind_err = |source| NetError::Bind {
            addr: addr.to_string(),
            source,
        };

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(backlog).map_err(bind_err)?;

        let inner: TcpListener = socket.into();
        let local_addr = inner.local_addr().map_err(bind_err)?;
        Ok(Self { inner, local_addr })
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Polls the listening socket for readability, waiting at most `timeout`.
    ///
    /// Returns `Ok(true)` when an incoming connection is ready to accept.
    /// `EINTR` (a signal arrived mid-poll) reports as `Ok(false)` so the
    /// caller can re-check its running flag.
    pub fn poll_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut fds = [PollFd::new(self.inner.as_fd(), PollFlags::POLLIN)];
        let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
        match poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(fds[0]
                .revents()
                .is_some_and(|revents| revents.contains(PollFlags::POLLIN))),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    /// Accepts one pending connection.
    pub fn accept(&self) -> io::Result<(Stream, SocketAddr)> {
        let (stream, peer) = self.inner.accept()?;
        Ok((Stream { inner: stream }, peer))
    }
}

/// An accepted client connection with per-call receive/send timeouts.
pub struct Stream {
    inner: TcpStream,
}

impl Stream {
    /// Sets the receive timeout applied to each [`recv`](Self::recv) call.
    pub fn set_recv_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.inner.set_read_timeout(Some(timeout))
    }

    /// Sets the send timeout applied to each [`send`](Self::send) call.
    pub fn set_send_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.inner.set_write_timeout(Some(timeout))
    }

    /// Returns the peer's address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Reads once into `buf`.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<RecvOutcome> {
        match self.inner.read(buf) {
            Ok(0) => Ok(RecvOutcome::Eof),
            Ok(n) => Ok(RecvOutcome::Data(n)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(RecvOutcome::TimedOut)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes once from `buf`, returning the number of bytes accepted.
    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    /// Sends all of `buf`, looping over [`send`](Self::send) until drained.
    pub fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut sent = 0;
        while sent < buf.len() {
            let n = self.send(&buf[sent..])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer stopped accepting bytes",
                ));
            }
            sent += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as ClientStream;

    fn listener() -> Listener {
        Listener::bind("127.0.0.1", 0, 16).unwrap()
    }

    #[test]
    fn bind_assigns_ephemeral_port() {
        let l = listener();
        assert_ne!(l.local_addr().port(), 0);
    }

    #[test]
    fn bind_error_on_bad_host() {
        assert!(matches!(
            Listener::bind("not-a-host", 80, 16),
            Err(NetError::Bind { .. })
        ));
    }

    #[test]
    fn poll_times_out_with_no_connection() {
        let l = listener();
        assert!(!l.poll_readable(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn poll_accept_roundtrip() {
        let l = listener();
        let _client = ClientStream::connect(l.local_addr()).unwrap();
        assert!(l.poll_readable(Duration::from_millis(500)).unwrap());
        let (stream, peer) = l.accept().unwrap();
        assert_eq!(peer, stream.peer_addr().unwrap());
    }

    #[test]
    fn recv_reports_eof_on_peer_close() {
        let l = listener();
        let client = ClientStream::connect(l.local_addr()).unwrap();
        let (mut stream, _) = l.accept().unwrap();
        drop(client);
        let mut buf = [0u8; 16];
        assert_eq!(stream.recv(&mut buf).unwrap(), RecvOutcome::Eof);
    }

    #[test]
    fn recv_reports_timeout() {
        let l = listener();
        let _client = ClientStream::connect(l.local_addr()).unwrap();
        let (mut stream, _) = l.accept().unwrap();
        stream.set_recv_timeout(Duration::from_millis(30)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(stream.recv(&mut buf).unwrap(), RecvOutcome::TimedOut);
    }

    #[test]
    fn send_all_is_received() {
        let l = listener();
        let mut client = ClientStream::connect(l.local_addr()).unwrap();
        let (mut stream, _) = l.accept().unwrap();
        stream.send_all(b"ping").unwrap();
        drop(stream);
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"ping");
    }
}
