//! Secure session state machine
//!
//! A [`SecureSession`] binds one secure channel to one socket and one
//! [`SecureContext`]. Handshake, read and write all share one retry loop:
//! a would-block outcome waits for readiness and retries the identical
//! call, everything else ends the operation.
//!
//! ```text
//! Fresh -> Handshaking -> Established -> Closed
//!               |              |
//!               +--> Failed <--+
//! ```
//!
//! The handshake is bounded by a single deadline fixed by the caller; each
//! read and write gets a fresh deadline from the session's I/O timeout.

use super::channel::{OpenSslChannel, Progress, SecureChannel};
use super::cert::Certificate;
use super::context::SecureContext;
use super::error::TlsError;
use super::handshake::{self, VerificationOverride, DEFAULT_IO_TIMEOUT};
use crate::net::{PollEvents, PollWaiter, ReadinessWait, WaitResult};
use std::io;
use std::time::{Duration, Instant};

/// Lifecycle state of a [`SecureSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Handshaking,
    Established,
    /// Terminal: closed by the application
    Closed,
    /// Terminal: a handshake, verification or I/O failure
    Failed,
}

/// One encrypted channel over one socket
///
/// Operations take `&mut self`; sharing a session between threads needs an
/// external lock.
pub struct SecureSession<C: SecureChannel = OpenSslChannel, W: ReadinessWait = PollWaiter> {
    channel: C,
    waiter: W,
    context: SecureContext,
    state: SessionState,
    peer_certificate: Option<Certificate>,
    io_timeout: Duration,
    peer_closed: bool,
}

/// Session over OpenSSL and `poll(2)`
pub type TlsSession = SecureSession<OpenSslChannel, PollWaiter>;

impl<C: SecureChannel> SecureSession<C, PollWaiter> {
    /// Create a session that waits with `poll(2)`
    pub fn new(channel: C, context: SecureContext) -> Self {
        Self::with_waiter(channel, PollWaiter, context)
    }
}

impl<C: SecureChannel, W: ReadinessWait> SecureSession<C, W> {
    /// Create a session that waits for readiness through `waiter`
    pub fn with_waiter(channel: C, waiter: W, context: SecureContext) -> Self {
        SecureSession {
            channel,
            waiter,
            context,
            state: SessionState::Fresh,
            peer_certificate: None,
            io_timeout: DEFAULT_IO_TIMEOUT,
            peer_closed: false,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the handshake completed and the session is still usable
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Whether a read has seen the peer's close_notify
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Certificate the peer presented during the handshake
    pub fn peer_certificate(&self) -> Option<&Certificate> {
        self.peer_certificate.as_ref()
    }

    /// Context the session was created from
    pub fn context(&self) -> &SecureContext {
        &self.context
    }

    /// Underlying secure channel
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Readiness wait used between retries
    pub fn waiter(&self) -> &W {
        &self.waiter
    }

    /// Timeout applied to each `read` and `write` call
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Set the per-operation read/write timeout
    pub fn set_io_timeout(&mut self, timeout: Duration) {
        self.io_timeout = timeout;
    }

    /// Run the server side of the handshake
    pub fn perform_server_handshake(&mut self, deadline: Instant) -> Result<(), TlsError> {
        self.begin_handshake()?;

        if let Err(e) = self.drive("handshake", deadline, |channel| channel.handshake()) {
            return Err(self.fail_handshake(e));
        }

        self.peer_certificate = self.channel.peer_certificate();
        self.state = SessionState::Established;
        tracing::debug!(peer = ?self.peer_certificate, "server handshake complete");
        Ok(())
    }

    /// Run the client side of the handshake, then verify the server
    ///
    /// The session only becomes established once the server certificate
    /// passed verification or `verification_override` accepted it.
    pub fn perform_client_handshake(
        &mut self,
        deadline: Instant,
        verification_override: Option<&VerificationOverride>,
    ) -> Result<(), TlsError> {
        self.begin_handshake()?;

        if let Err(e) = self.drive("handshake", deadline, |channel| channel.handshake()) {
            return Err(self.fail_handshake(e));
        }

        match handshake::verify_peer(&self.channel, verification_override) {
            Ok(certificate) => {
                tracing::debug!(peer = ?certificate, "client handshake complete");
                self.peer_certificate = Some(certificate);
                self.state = SessionState::Established;
                Ok(())
            }
            Err(e) => Err(self.fail_handshake(e)),
        }
    }

    /// Read into `buf` within the session's I/O timeout
    ///
    /// `Err(ConnectionClosed)` means the peer closed the TLS connection
    /// cleanly; the session stays established until [`close`](Self::close).
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        self.read_timeout(buf, self.io_timeout)
    }

    /// Read into `buf`, waiting at most `timeout`
    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TlsError> {
        self.ensure_established()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = handshake::deadline_after(timeout);
        let result = self.drive("read", deadline, |channel| channel.read(buf));
        self.settle(result)
    }

    /// Write part of `buf` within the session's I/O timeout
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, TlsError> {
        self.ensure_established()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = handshake::deadline_after(self.io_timeout);
        let result = self.drive("write", deadline, |channel| channel.write(buf));
        self.settle(result)
    }

    /// Write the whole of `buf` under a single I/O timeout
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<(), TlsError> {
        self.ensure_established()?;

        let deadline = handshake::deadline_after(self.io_timeout);
        while !buf.is_empty() {
            let result = self.drive("write", deadline, |channel| channel.write(buf));
            match self.settle(result)? {
                0 => {
                    self.state = SessionState::Failed;
                    return Err(TlsError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "secure channel accepted no data",
                    )));
                }
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// Close the session; further calls are no-ops
    ///
    /// An established session sends close_notify first. The socket is shut
    /// down in both directions.
    pub fn close(&mut self) {
        match self.state {
            SessionState::Closed => return,
            SessionState::Established => self.channel.shutdown(),
            _ => {}
        }
        self.channel.close_transport();
        self.state = SessionState::Closed;
        tracing::debug!("session closed");
    }

    fn begin_handshake(&mut self) -> Result<(), TlsError> {
        if self.state != SessionState::Fresh {
            return Err(TlsError::InvalidState(self.state));
        }
        self.state = SessionState::Handshaking;
        Ok(())
    }

    fn fail_handshake(&mut self, err: TlsError) -> TlsError {
        tracing::debug!(error = %err, "handshake failed");
        self.state = SessionState::Failed;
        err
    }

    fn ensure_established(&self) -> Result<(), TlsError> {
        match self.state {
            SessionState::Established => Ok(()),
            state => Err(TlsError::InvalidState(state)),
        }
    }

    /// Record the effect of a read/write outcome on the session state
    fn settle(&mut self, result: Result<usize, TlsError>) -> Result<usize, TlsError> {
        match &result {
            Ok(_) | Err(TlsError::Timeout) => {}
            Err(TlsError::ConnectionClosed) => self.peer_closed = true,
            Err(_) => self.state = SessionState::Failed,
        }
        result
    }

    /// Call `step` until it completes, waiting for readiness in between
    ///
    /// `step` must repeat the identical primitive call each time.
    fn drive<F>(&mut self, op: &'static str, deadline: Instant, mut step: F) -> Result<usize, TlsError>
    where
        F: FnMut(&mut C) -> Progress,
    {
        let mut retries = 0u32;
        loop {
            let events = match step(&mut self.channel) {
                Progress::Done(n) => return Ok(n),
                Progress::WantRead => PollEvents::Read,
                Progress::WantWrite => PollEvents::Write,
                Progress::ZeroReturn => return Err(TlsError::ConnectionClosed),
                Progress::Fatal(fault) => return Err(fault.into()),
            };

            retries += 1;
            tracing::trace!(op, ?events, retries, "would block");

            if Instant::now() >= deadline {
                return Err(TlsError::Timeout);
            }
            match self.waiter.wait(self.channel.raw_fd(), deadline, events) {
                WaitResult::Ready => {}
                WaitResult::Timeout => return Err(TlsError::Timeout),
                WaitResult::Closed => return Err(TlsError::ConnectionClosed),
                WaitResult::Error(msg) => return Err(TlsError::Io(io::Error::new(io::ErrorKind::Other, msg))),
            }
        }
    }
}

impl<C: SecureChannel, W: ReadinessWait> io::Read for SecureSession<C, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match SecureSession::read(self, buf) {
            Ok(n) => Ok(n),
            Err(TlsError::ConnectionClosed) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl<C: SecureChannel, W: ReadinessWait> io::Write for SecureSession<C, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SecureSession::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<C: SecureChannel, W: ReadinessWait> std::fmt::Debug for SecureSession<C, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("state", &self.state)
            .field("io_timeout", &self.io_timeout)
            .field("peer_closed", &self.peer_closed)
            .field("peer_certificate", &self.peer_certificate)
            .finish()
    }
}

impl<C: SecureChannel, W: ReadinessWait> Drop for SecureSession<C, W> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::cert::test_identity;
    use crate::tls::channel::testing::{ScriptedChannel, ScriptedWaiter, SteppingWaiter};
    use crate::tls::channel::ChannelFault;
    use tracing_test::traced_test;

    fn session(script: Vec<Progress>) -> SecureSession<ScriptedChannel, ScriptedWaiter> {
        SecureSession::with_waiter(
            ScriptedChannel::new(script),
            ScriptedWaiter::default(),
            SecureContext::server(),
        )
    }

    fn established(script: Vec<Progress>) -> SecureSession<ScriptedChannel, ScriptedWaiter> {
        let mut all = vec![Progress::Done(0)];
        all.extend(script);
        let mut session = session(all);
        session.perform_server_handshake(far()).unwrap();
        session
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn test_immediate_handshake_needs_no_wait() {
        let mut session = session(vec![Progress::Done(0)]);
        assert_eq!(session.state(), SessionState::Fresh);

        session.perform_server_handshake(far()).unwrap();
        assert_eq!(session.state(), SessionState::Established);
        assert_eq!(session.waiter().wait_count(), 0);
        assert_eq!(session.channel().calls.len(), 1);
    }

    #[traced_test]
    #[test]
    fn test_handshake_retries_until_done() {
        let mut session = session(vec![
            Progress::WantRead,
            Progress::WantWrite,
            Progress::WantRead,
            Progress::Done(0),
        ]);
        let deadline = far();
        session.perform_server_handshake(deadline).unwrap();

        assert!(session.is_established());
        let waits = session.waiter().waits.borrow().clone();
        assert_eq!(
            waits.iter().map(|(_, events)| *events).collect::<Vec<_>>(),
            vec![PollEvents::Read, PollEvents::Write, PollEvents::Read]
        );
        // One deadline for the whole handshake.
        assert!(waits.iter().all(|(d, _)| *d == deadline));
        assert!(logs_contain("would block"));
    }

    #[test]
    fn test_read_retry_uses_identical_arguments() {
        let mut session = established(vec![
            Progress::WantRead,
            Progress::WantWrite,
            Progress::Done(4),
        ]);
        session.channel.read_data = b"ping".to_vec();

        let mut buf = [0u8; 64];
        assert_eq!(session.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        let reads: Vec<_> = session
            .channel()
            .calls
            .iter()
            .filter(|call| call.op == "read")
            .cloned()
            .collect();
        assert_eq!(reads.len(), 3);
        assert!(reads.iter().all(|call| *call == reads[0]));
        assert_eq!(reads[0].len, 64);
    }

    #[test]
    fn test_handshake_respects_deadline() {
        let script = (0..10_000).map(|_| Progress::WantRead).collect();
        let mut session = SecureSession::with_waiter(
            ScriptedChannel::new(script),
            SteppingWaiter {
                step: Duration::from_millis(20),
            },
            SecureContext::server(),
        );

        let timeout = Duration::from_millis(200);
        let start = Instant::now();
        let err = session.perform_server_handshake(start + timeout).unwrap_err();

        assert!(matches!(err, TlsError::Timeout));
        assert!(start.elapsed() >= timeout);
        assert!(start.elapsed() < timeout + Duration::from_millis(500));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_wait_outcomes_abort_handshake() {
        let cases = vec![
            (WaitResult::Timeout, "timeout"),
            (WaitResult::Closed, "closed"),
            (WaitResult::Error("boom".into()), "io"),
        ];
        for (outcome, name) in cases {
            let mut session = SecureSession::with_waiter(
                ScriptedChannel::new(vec![Progress::WantRead, Progress::Done(0)]),
                ScriptedWaiter::new(vec![outcome]),
                SecureContext::server(),
            );
            let err = session.perform_server_handshake(far()).unwrap_err();
            match name {
                "timeout" => assert!(matches!(err, TlsError::Timeout)),
                "closed" => assert!(matches!(err, TlsError::ConnectionClosed)),
                _ => assert!(matches!(err, TlsError::Io(_))),
            }
            assert_eq!(session.state(), SessionState::Failed);
            assert_eq!(session.channel().calls.len(), 1);
        }
    }

    #[test]
    fn test_wait_closed_during_read_reports_peer_close() {
        let mut session = established(vec![Progress::WantRead, Progress::Done(4)]);
        session.waiter.script.borrow_mut().push_back(WaitResult::Closed);

        let mut buf = [0u8; 16];
        assert!(matches!(session.read(&mut buf), Err(TlsError::ConnectionClosed)));
        assert!(session.peer_closed());
        assert_eq!(session.state(), SessionState::Established);
        assert_eq!(session.waiter().wait_count(), 1);
    }

    #[test]
    fn test_wait_outcomes_during_write() {
        let mut session = established(vec![Progress::WantWrite, Progress::Done(4)]);
        session.waiter.script.borrow_mut().push_back(WaitResult::Closed);
        assert!(matches!(session.write(b"ping"), Err(TlsError::ConnectionClosed)));
        assert!(session.peer_closed());
        assert_eq!(session.state(), SessionState::Established);

        let mut session = established(vec![Progress::WantWrite, Progress::Done(4)]);
        session
            .waiter
            .script
            .borrow_mut()
            .push_back(WaitResult::Error("boom".into()));
        assert!(matches!(session.write(b"ping"), Err(TlsError::Io(_))));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(
            session.write(b"ping"),
            Err(TlsError::InvalidState(SessionState::Failed))
        ));
    }

    #[test]
    fn test_wait_error_during_read_fails_session() {
        let mut session = established(vec![Progress::WantRead, Progress::Done(4)]);
        session
            .waiter
            .script
            .borrow_mut()
            .push_back(WaitResult::Error("boom".into()));

        let mut buf = [0u8; 16];
        assert!(matches!(session.read(&mut buf), Err(TlsError::Io(_))));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.peer_closed());
    }

    #[test]
    fn test_debug_shows_state() {
        let session = established(Vec::new());
        let shown = format!("{:?}", session);
        assert!(shown.contains("Established"));
        assert!(shown.contains("io_timeout"));
    }

    #[test]
    fn test_fatal_handshake_outcomes_are_not_retried() {
        let outcomes = vec![
            Progress::Fatal(ChannelFault::Protocol("bad certificate".into())),
            Progress::Fatal(ChannelFault::Io(io::Error::from(io::ErrorKind::ConnectionReset))),
            Progress::Fatal(ChannelFault::Unexpected("code 42".into())),
            Progress::ZeroReturn,
        ];
        for outcome in outcomes {
            let mut session = session(vec![outcome, Progress::Done(0)]);
            assert!(session.perform_server_handshake(far()).is_err());
            assert_eq!(session.state(), SessionState::Failed);
            assert_eq!(session.channel().calls.len(), 1);
            assert_eq!(session.waiter().wait_count(), 0);
        }
    }

    #[test]
    fn test_client_handshake_without_certificate_rejected() {
        let mut session = session(vec![Progress::Done(0)]);
        let accept_all = |_: &Certificate| true;

        let err = session
            .perform_client_handshake(far(), Some(&accept_all))
            .unwrap_err();
        assert!(matches!(err, TlsError::Rejected(_)));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_client_handshake_override() {
        let mut channel = ScriptedChannel::new(vec![Progress::Done(0)]);
        channel.peer = Some(test_identity("pinned.test").0);
        channel.verify = Some("self-signed certificate".into());
        let mut session =
            SecureSession::with_waiter(channel, ScriptedWaiter::default(), SecureContext::client());

        let accept_all = |_: &Certificate| true;
        session
            .perform_client_handshake(far(), Some(&accept_all))
            .unwrap();
        assert!(session.is_established());
        assert_eq!(
            session.peer_certificate().unwrap().common_name().as_deref(),
            Some("pinned.test")
        );
    }

    #[test]
    fn test_handshake_only_once() {
        let mut session = established(Vec::new());
        assert!(matches!(
            session.perform_server_handshake(far()),
            Err(TlsError::InvalidState(SessionState::Established))
        ));
    }

    #[test]
    fn test_io_requires_established() {
        let mut session = session(Vec::new());
        let mut buf = [0u8; 8];
        assert!(matches!(
            session.read(&mut buf),
            Err(TlsError::InvalidState(SessionState::Fresh))
        ));
        assert!(matches!(
            session.write(b"x"),
            Err(TlsError::InvalidState(SessionState::Fresh))
        ));
    }

    #[test]
    fn test_peer_close_keeps_session_established() {
        let mut session = established(vec![Progress::ZeroReturn]);
        let mut buf = [0u8; 8];

        assert!(matches!(session.read(&mut buf), Err(TlsError::ConnectionClosed)));
        assert!(session.peer_closed());
        assert_eq!(session.state(), SessionState::Established);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_read_timeout_keeps_session_usable() {
        let mut session = SecureSession::with_waiter(
            ScriptedChannel::new(vec![Progress::Done(0), Progress::WantRead, Progress::Done(2)]),
            ScriptedWaiter::new(vec![WaitResult::Timeout]),
            SecureContext::server(),
        );
        session.perform_server_handshake(far()).unwrap();
        session.channel.read_data = b"ok".to_vec();

        let mut buf = [0u8; 8];
        assert!(matches!(session.read(&mut buf), Err(TlsError::Timeout)));
        assert!(session.is_established());
        assert_eq!(session.read(&mut buf).unwrap(), 2);
    }

    #[test]
    fn test_read_fault_fails_session() {
        let mut session = established(vec![Progress::Fatal(ChannelFault::Protocol(
            "decryption failed".into(),
        ))]);
        let mut buf = [0u8; 8];
        assert!(matches!(session.read(&mut buf), Err(TlsError::Protocol(_))));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(
            session.read(&mut buf),
            Err(TlsError::InvalidState(SessionState::Failed))
        ));
    }

    #[test]
    fn test_write_all_handles_partial_writes() {
        let mut session = established(vec![
            Progress::Done(3),
            Progress::WantWrite,
            Progress::Done(100),
        ]);
        session.write_all(b"hello world").unwrap();

        let writes: Vec<_> = session
            .channel()
            .calls
            .iter()
            .filter(|call| call.op == "write")
            .map(|call| call.len)
            .collect();
        assert_eq!(writes, vec![11, 8, 8]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut session = established(Vec::new());
        session.close();
        session.close();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.channel().shutdowns, 1);
        assert_eq!(session.channel().transport_closes, 1);
    }

    #[test]
    fn test_close_without_handshake_skips_close_notify() {
        let mut session = session(Vec::new());
        session.close();
        assert_eq!(session.channel().shutdowns, 0);
        assert_eq!(session.channel().transport_closes, 1);
    }

    #[test]
    fn test_io_traits() {
        use std::io::{Read, Write};

        let mut session = established(vec![Progress::Done(5), Progress::ZeroReturn]);
        session.channel.read_data = b"hello".to_vec();

        let mut out = Vec::new();
        session.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");

        let mut session = established(vec![Progress::Done(2)]);
        assert_eq!(Write::write(&mut session, b"hi").unwrap(), 2);
        session.flush().unwrap();
    }
}
