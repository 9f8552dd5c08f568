//! Accept engine
//!
//! TCP accept, optional address veto, server handshake, optional session
//! veto. The raw socket belongs to the engine until the session is handed
//! back; every failure path closes it exactly once.

use super::context::{Role, SecureContext};
use super::channel::OpenSslChannel;
use super::error::TlsError;
use super::handshake::{self, DEFAULT_IO_TIMEOUT};
use super::session::{SecureSession, TlsSession};
use crate::net::{self, AcceptResult};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

/// Veto on a client address before any handshake starts
pub type AddressFilter = dyn Fn(&SocketAddr) -> bool + Send + Sync;

/// Veto on an established session
pub type SessionFilter = dyn Fn(&TlsSession, &SocketAddr) -> bool + Send + Sync;

/// An established server-side session and its client's address
pub struct Accepted {
    pub session: TlsSession,
    pub peer_addr: SocketAddr,
}

/// Server-side connection factory
#[derive(Clone)]
pub struct Acceptor {
    context: SecureContext,
    timeout: Duration,
    io_timeout: Duration,
    address_filter: Option<Arc<AddressFilter>>,
    session_filter: Option<Arc<SessionFilter>>,
}

impl Acceptor {
    /// Create an acceptor for a server context
    pub fn new(context: SecureContext) -> Self {
        Acceptor {
            context,
            timeout: handshake::default_handshake_timeout(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            address_filter: None,
            session_filter: None,
        }
    }

    /// Bound on waiting for a connection plus its handshake
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Read/write timeout of accepted sessions
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Refuse clients for which `filter` returns `false`
    pub fn address_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.address_filter = Some(Arc::new(filter));
        self
    }

    /// Refuse established sessions for which `filter` returns `false`
    pub fn session_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&TlsSession, &SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.session_filter = Some(Arc::new(filter));
        self
    }

    /// Context sessions are created from
    pub fn context(&self) -> &SecureContext {
        &self.context
    }

    /// Bound on the TCP accept plus the handshake
    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }

    /// Accept one connection and complete the server handshake
    ///
    /// `Timeout` and `ConnectionClosed` come from the TCP accept (or the
    /// handshake) and are worth retrying; a closed listener surfaces as
    /// `ConnectionClosed`.
    pub fn accept(&self, listener: &TcpListener) -> Result<Accepted, TlsError> {
        if self.context.role() != Role::Server {
            return Err(TlsError::config("Cannot accept with a client context"));
        }
        let ssl_context = self.context.ssl_context()?;
        let deadline = handshake::deadline_after(self.timeout);

        let (stream, peer_addr) = match net::accept_tcp(listener, self.timeout) {
            AcceptResult::Accepted(stream, peer) => (stream, peer),
            AcceptResult::Timeout => return Err(TlsError::Timeout),
            AcceptResult::Closed => return Err(TlsError::ConnectionClosed),
            AcceptResult::Error(msg) => {
                return Err(TlsError::Io(io::Error::new(io::ErrorKind::Other, msg)))
            }
        };

        if let Some(filter) = &self.address_filter {
            if !filter(&peer_addr) {
                tracing::warn!(peer = %peer_addr, "connection refused by address filter");
                let _ = stream.shutdown(Shutdown::Both);
                return Err(TlsError::Rejected(format!(
                    "address {} refused by address filter",
                    peer_addr
                )));
            }
        }

        let channel = OpenSslChannel::server(&ssl_context, stream)?;
        let mut session = SecureSession::new(channel, self.context.clone());
        session.set_io_timeout(self.io_timeout);

        if let Err(e) = session.perform_server_handshake(deadline) {
            tracing::debug!(peer = %peer_addr, error = %e, "server handshake failed");
            return Err(e);
        }

        if let Some(filter) = &self.session_filter {
            if !filter(&session, &peer_addr) {
                tracing::warn!(peer = %peer_addr, "session refused by session filter");
                return Err(TlsError::Rejected(format!(
                    "session from {} refused by session filter",
                    peer_addr
                )));
            }
        }

        tracing::debug!(peer = %peer_addr, "accepted secure session");
        Ok(Accepted { session, peer_addr })
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("context", &self.context)
            .field("timeout", &self.timeout)
            .field("io_timeout", &self.io_timeout)
            .field("address_filter", &self.address_filter.is_some())
            .field("session_filter", &self.session_filter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::bind_listener;

    fn listener() -> TcpListener {
        bind_listener("127.0.0.1:0".parse().unwrap(), 4).unwrap()
    }

    #[test]
    fn test_client_context_cannot_accept() {
        let acceptor = Acceptor::new(SecureContext::client());
        assert!(matches!(
            acceptor.accept(&listener()),
            Err(TlsError::Configuration(_))
        ));
    }

    #[test]
    fn test_unconfigured_server_fails_before_accepting() {
        let acceptor = Acceptor::new(SecureContext::server()).timeout(Duration::from_secs(5));
        let start = std::time::Instant::now();
        assert!(matches!(
            acceptor.accept(&listener()),
            Err(TlsError::Configuration(_))
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_builder_defaults() {
        let acceptor = Acceptor::new(SecureContext::server());
        assert_eq!(acceptor.get_timeout(), Duration::from_secs(10));
        assert_eq!(acceptor.io_timeout, DEFAULT_IO_TIMEOUT);
        assert!(acceptor.address_filter.is_none());

        let acceptor = acceptor
            .timeout(Duration::from_millis(100))
            .address_filter(|_| true);
        assert_eq!(acceptor.get_timeout(), Duration::from_millis(100));
        assert!(acceptor.address_filter.is_some());
    }
}
