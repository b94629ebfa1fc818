//! Listening socket.
//!
//! Accept failures are classified three ways:
//! - per-connection (peer gave up before we got to it): skip, try the next one
//! - resource exhaustion (out of descriptors or memory): stop this burst
//! - the listening socket itself is unusable: fatal to the server

use crate::runtime::connection::{BufferLimits, Connection};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use std::io;
use std::net::SocketAddr;
use tracing::{debug, error, warn};

/// Platform maximum listen backlog.
#[cfg(unix)]
pub const MAX_BACKLOG: i32 = libc::SOMAXCONN;
#[cfg(not(unix))]
pub const MAX_BACKLOG: i32 = 1024;

/// Owns the bound, listening, non-blocking socket.
pub struct Listener {
    inner: TcpListener,
    limits: BufferLimits,
}

impl Listener {
    /// Bind `addr` with `SO_REUSEADDR` and start listening.
    pub fn bind(addr: SocketAddr, backlog: i32, limits: BufferLimits) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;

        let std_listener: std::net::TcpListener = socket.into();
        Ok(Self {
            inner: TcpListener::from_std(std_listener),
            limits,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.inner, token, Interest::READABLE)
    }

    /// Accept one pending connection.
    ///
    /// Returns `Ok(None)` when nothing is pending or the process is out of
    /// resources for now. Returns `Err` only when the listening socket can no
    /// longer be used.
    pub fn accept_one(&self) -> io::Result<Option<Connection<TcpStream>>> {
        loop {
            match self.inner.accept() {
                // mio accepts with SOCK_NONBLOCK, so the stream is ready for the loop
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "accepted connection");
                    return Ok(Some(Connection::new(stream, Some(peer), self.limits)));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => match classify(&e) {
                    AcceptError::Retry => {
                        debug!(error = %e, "accept failed for one connection");
                    }
                    AcceptError::Exhausted => {
                        warn!(error = %e, "accept deferred, out of resources");
                        return Ok(None);
                    }
                    AcceptError::Fatal => {
                        error!(error = %e, "listening socket unusable");
                        return Err(e);
                    }
                },
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum AcceptError {
    Retry,
    Exhausted,
    Fatal,
}

fn classify(e: &io::Error) -> AcceptError {
    if let Some(class) = e.raw_os_error().and_then(classify_os_error) {
        return class;
    }

    match e.kind() {
        io::ErrorKind::OutOfMemory => AcceptError::Exhausted,
        // ECONNABORTED, EPROTO, EPERM, EINTR and friends only affect one peer
        _ => AcceptError::Retry,
    }
}

#[cfg(unix)]
fn classify_os_error(code: i32) -> Option<AcceptError> {
    match code {
        libc::EBADF | libc::ENOTSOCK | libc::EINVAL | libc::EOPNOTSUPP => Some(AcceptError::Fatal),
        libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => Some(AcceptError::Exhausted),
        _ => None,
    }
}

#[cfg(not(unix))]
fn classify_os_error(_code: i32) -> Option<AcceptError> {
    None
}
