//! Receive loop
//!
//! Drives an established session's reads and hands each chunk to a
//! [`Receiver`] until the receiver, the peer or an error ends the loop.

use super::channel::SecureChannel;
use super::error::TlsError;
use super::session::SecureSession;
use crate::net::ReadinessWait;
use std::time::Duration;

/// Default receive buffer size
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 16 * 1024;

/// Consumer of data read by [`SecureSession::receive_loop`]
pub trait Receiver {
    /// Handle one chunk; return `false` to stop receiving
    fn on_data(&mut self, data: &[u8]) -> bool;

    /// Nothing arrived within the idle timeout; return `false` to stop
    fn on_idle(&mut self) -> bool {
        true
    }

    /// The peer closed the connection
    fn on_closed(&mut self) {}

    /// Reading failed; the loop stops afterwards
    fn on_error(&mut self, _err: &TlsError) {}
}

/// Why a receive loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveEnd {
    /// `on_data` or `on_idle` asked to stop
    Stopped,
    /// The peer closed the connection
    PeerClosed,
    /// A read failed
    Failed,
}

impl<C: SecureChannel, W: ReadinessWait> SecureSession<C, W> {
    /// Read until `receiver` stops, the peer closes or a read fails
    ///
    /// Each read waits at most `idle`; an idle period is reported through
    /// [`Receiver::on_idle`].
    pub fn receive_loop<R: Receiver + ?Sized>(
        &mut self,
        buffer_size: usize,
        idle: Duration,
        receiver: &mut R,
    ) -> ReceiveEnd {
        let mut buffer = vec![0u8; buffer_size.max(1)];
        loop {
            match self.read_timeout(&mut buffer, idle) {
                Ok(n) => {
                    if !receiver.on_data(&buffer[..n]) {
                        return ReceiveEnd::Stopped;
                    }
                }
                Err(TlsError::Timeout) => {
                    if !receiver.on_idle() {
                        return ReceiveEnd::Stopped;
                    }
                }
                Err(TlsError::ConnectionClosed) => {
                    receiver.on_closed();
                    return ReceiveEnd::PeerClosed;
                }
                Err(err) => {
                    tracing::debug!(error = %err, "receive loop ended by error");
                    receiver.on_error(&err);
                    return ReceiveEnd::Failed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::WaitResult;
    use crate::tls::channel::testing::{ScriptedChannel, ScriptedWaiter};
    use crate::tls::channel::{ChannelFault, Progress};
    use crate::tls::context::SecureContext;
    use std::time::Instant;

    #[derive(Default)]
    struct Collect {
        data: Vec<u8>,
        idles: usize,
        max_idles: usize,
        closed: bool,
        errors: Vec<String>,
    }

    impl Receiver for Collect {
        fn on_data(&mut self, data: &[u8]) -> bool {
            self.data.extend_from_slice(data);
            true
        }

        fn on_idle(&mut self) -> bool {
            self.idles += 1;
            self.idles < self.max_idles
        }

        fn on_closed(&mut self) {
            self.closed = true;
        }

        fn on_error(&mut self, err: &TlsError) {
            self.errors.push(err.to_string());
        }
    }

    fn session(
        script: Vec<Progress>,
        waits: Vec<WaitResult>,
        data: &[u8],
    ) -> SecureSession<ScriptedChannel, ScriptedWaiter> {
        let mut all = vec![Progress::Done(0)];
        all.extend(script);
        let mut channel = ScriptedChannel::new(all);
        channel.read_data = data.to_vec();
        let mut session =
            SecureSession::with_waiter(channel, ScriptedWaiter::new(waits), SecureContext::server());
        session
            .perform_server_handshake(Instant::now() + Duration::from_secs(5))
            .unwrap();
        session
    }

    #[test]
    fn test_loop_until_peer_closes() {
        let mut session = session(
            vec![Progress::Done(3), Progress::Done(3), Progress::ZeroReturn],
            Vec::new(),
            b"abcdef",
        );
        let mut receiver = Collect::default();

        let end = session.receive_loop(DEFAULT_RECEIVE_BUFFER_SIZE, Duration::from_secs(1), &mut receiver);
        assert_eq!(end, ReceiveEnd::PeerClosed);
        assert_eq!(receiver.data, b"abcdef");
        assert!(receiver.closed);
    }

    #[test]
    fn test_idle_can_stop_loop() {
        let mut session = session(
            vec![Progress::WantRead, Progress::WantRead],
            vec![WaitResult::Timeout, WaitResult::Timeout],
            b"",
        );
        let mut receiver = Collect {
            max_idles: 2,
            ..Default::default()
        };

        let end = session.receive_loop(64, Duration::from_millis(10), &mut receiver);
        assert_eq!(end, ReceiveEnd::Stopped);
        assert_eq!(receiver.idles, 2);
        assert!(session.is_established());
    }

    #[test]
    fn test_error_ends_loop() {
        let mut session = session(
            vec![Progress::Fatal(ChannelFault::Protocol("bad record mac".into()))],
            Vec::new(),
            b"",
        );
        let mut receiver = Collect::default();

        let end = session.receive_loop(64, Duration::from_secs(1), &mut receiver);
        assert_eq!(end, ReceiveEnd::Failed);
        assert_eq!(receiver.errors.len(), 1);
        assert!(receiver.errors[0].contains("bad record mac"));
    }
}
