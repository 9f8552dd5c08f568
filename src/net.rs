//! Socket collaborators for the TLS engine
//!
//! The TLS layer never touches raw sockets directly. It relies on three
//! collaborators provided here:
//!
//! - [`ReadinessWait`] blocks until a socket is ready, a deadline passes or
//!   the peer goes away. [`PollWaiter`] implements it with `poll(2)`.
//! - [`accept_tcp`] accepts one connection from a listening socket.
//! - [`connect_tcp`] resolves an address and connects under a timeout.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, Instant};

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

impl PollEvents {
    fn as_poll_flags(self) -> libc::c_short {
        match self {
            PollEvents::Read => libc::POLLIN,
            PollEvents::Write => libc::POLLOUT,
            PollEvents::Both => libc::POLLIN | libc::POLLOUT,
        }
    }
}

/// Outcome of a readiness wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult {
    /// The socket is ready for the requested events
    Ready,
    /// The deadline passed first
    Timeout,
    /// The peer hung up or the descriptor was closed underneath the wait
    Closed,
    /// The socket reported an error condition
    Error(String),
}

/// Readiness wait collaborator
///
/// Implementations must never hang past `deadline` and must surface a
/// descriptor closed by another thread as [`WaitResult::Closed`] or
/// [`WaitResult::Error`].
pub trait ReadinessWait {
    fn wait(&self, fd: RawFd, deadline: Instant, events: PollEvents) -> WaitResult;
}

/// `poll(2)` based readiness wait
#[derive(Debug, Clone, Copy, Default)]
pub struct PollWaiter;

impl ReadinessWait for PollWaiter {
    fn wait(&self, fd: RawFd, deadline: Instant, events: PollEvents) -> WaitResult {
        use libc::{poll, pollfd, POLLERR, POLLHUP, POLLNVAL};

        let requested = events.as_poll_flags();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return WaitResult::Timeout;
            }

            // Round up so a sub-millisecond remainder does not spin.
            let timeout_ms = (deadline - now).as_millis().clamp(1, i32::MAX as u128) as i32;

            let mut pfd = pollfd {
                fd,
                events: requested,
                revents: 0,
            };

            let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

            if result < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return WaitResult::Error(err.to_string());
            }

            if result == 0 {
                continue;
            }

            let revents = pfd.revents;
            if revents & POLLNVAL != 0 {
                return WaitResult::Closed;
            }
            if revents & POLLERR != 0 {
                return WaitResult::Error(pending_error(fd));
            }
            if revents & requested != 0 {
                return WaitResult::Ready;
            }
            if revents & POLLHUP != 0 {
                return WaitResult::Closed;
            }
        }
    }
}

fn pending_error(fd: RawFd) -> String {
    // SAFETY: the descriptor was handed to poll() by the caller and is still
    // owned by it for the duration of this call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    match SockRef::from(&borrowed).take_error() {
        Ok(Some(err)) => err.to_string(),
        Ok(None) => "socket reported an error condition".to_string(),
        Err(err) => err.to_string(),
    }
}

/// Deadline `timeout` from now, saturating for very large timeouts
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64))
}

/// Outcome of a TCP accept
#[derive(Debug)]
pub enum AcceptResult {
    Accepted(TcpStream, SocketAddr),
    Timeout,
    Closed,
    Error(String),
}

/// Accept one TCP connection, waiting at most `timeout`
///
/// The listener should be in non-blocking mode (see [`bind_listener`]) so a
/// connection that is reset between readiness and `accept()` cannot block.
pub fn accept_tcp(listener: &TcpListener, timeout: Duration) -> AcceptResult {
    let deadline = deadline_after(timeout);

    loop {
        match PollWaiter.wait(listener.as_raw_fd(), deadline, PollEvents::Read) {
            WaitResult::Ready => {}
            WaitResult::Timeout => return AcceptResult::Timeout,
            WaitResult::Closed => return AcceptResult::Closed,
            WaitResult::Error(msg) => return AcceptResult::Error(msg),
        }

        match listener.accept() {
            Ok((stream, peer)) => return AcceptResult::Accepted(stream, peer),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionAborted
                ) =>
            {
                continue;
            }
            Err(e) if e.raw_os_error() == Some(libc::EBADF) => return AcceptResult::Closed,
            Err(e) => return AcceptResult::Error(e.to_string()),
        }
    }
}

/// Connect to `address:port`, trying every resolved address until one
/// succeeds or the overall `timeout` is used up
///
/// A timeout is reported as an error of kind [`io::ErrorKind::TimedOut`].
pub fn connect_tcp(address: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let deadline = deadline_after(timeout);
    let mut last_err = None;

    for addr in (address, port).to_socket_addrs()? {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
        }

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        match socket.connect_timeout(&addr.into(), remaining) {
            Ok(()) => {
                socket.set_nodelay(true)?;
                return Ok(socket.into());
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "tcp connect attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no addresses resolved for {}", address),
        )
    }))
}

/// Bind a non-blocking listening socket with an explicit backlog
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
