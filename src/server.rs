//! Threaded TLS server
//!
//! [`SecureServer`] owns a listening socket and an accept thread. Each
//! established session is handed to the connection handler on a thread of
//! its own.

use crate::net;
use crate::tls::{
    Accepted, Acceptor, CertificateAndKeyFiles, SecureContext, TlsError, TlsSession,
    DEFAULT_IO_TIMEOUT,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Listen backlog used when none is configured
pub const DEFAULT_BACKLOG: i32 = 20;

/// How long one accept (including its handshake) may block the accept loop
pub const DEFAULT_ACCEPT_LOOP_DURATION: Duration = Duration::from_secs(5);

/// Listening parameters
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: IpAddr,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub backlog: i32,
    /// Bound on each accept plus handshake; also the stop latency
    pub accept_loop_duration: Duration,
    /// Read/write timeout of accepted sessions
    pub io_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            backlog: DEFAULT_BACKLOG,
            accept_loop_duration: DEFAULT_ACCEPT_LOOP_DURATION,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

type ConnectionHandler = dyn Fn(TlsSession, SocketAddr) + Send + Sync;
type ErrorHandler = dyn Fn(&TlsError) + Send + Sync;
type AliveHandler = dyn Fn() + Send + Sync;

/// Assemble a server context from files
///
/// With trusted locations the server also requires and verifies client
/// certificates. Domain contexts are added in order.
pub fn setup_server_context(
    files: &CertificateAndKeyFiles,
    trusted_locations: &[PathBuf],
    domains: &[SecureContext],
) -> Result<SecureContext, TlsError> {
    let context = SecureContext::server();
    context.install_certificate(&files.certificate)?;
    context.install_private_key(&files.private_key)?;
    context.verify_key_pair_matches()?;

    for location in trusted_locations {
        context.add_trusted_peer_location(location)?;
    }
    if !trusted_locations.is_empty() {
        context.enable_peer_verification()?;
    }

    for domain in domains {
        context.add_domain(domain)?;
    }

    Ok(context)
}

/// Builder for [`SecureServer`]
pub struct ServerBuilder {
    config: ServerConfig,
    acceptor: Acceptor,
    on_error: Option<Arc<ErrorHandler>>,
    on_alive: Option<Arc<AliveHandler>>,
}

impl ServerBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Refuse clients by address before the handshake
    pub fn address_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.acceptor = self.acceptor.address_filter(filter);
        self
    }

    /// Refuse clients after the handshake
    pub fn session_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&TlsSession, &SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.acceptor = self.acceptor.session_filter(filter);
        self
    }

    /// Called for every failed accept, except an idle accept loop
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TlsError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Called whenever an accept loop iteration sees no connection
    pub fn on_alive<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_alive = Some(Arc::new(handler));
        self
    }

    /// Bind and start accepting; `handler` gets every established session
    ///
    /// Context configuration errors and bind errors are returned here,
    /// before any thread starts.
    pub fn start<F>(self, handler: F) -> Result<SecureServer, TlsError>
    where
        F: Fn(TlsSession, SocketAddr) + Send + Sync + 'static,
    {
        let ServerBuilder {
            config,
            acceptor,
            on_error,
            on_alive,
        } = self;

        acceptor.context().ssl_context()?;

        let listener = net::bind_listener(config.socket_addr(), config.backlog)?;
        let local_addr = listener.local_addr()?;

        let acceptor = acceptor
            .timeout(config.accept_loop_duration)
            .io_timeout(config.io_timeout);
        let stop = Arc::new(AtomicBool::new(false));
        let handler: Arc<ConnectionHandler> = Arc::new(handler);

        let accept_loop = AcceptLoop {
            listener,
            acceptor,
            stop: Arc::clone(&stop),
            handler,
            on_error,
            on_alive,
        };

        let accept_thread = thread::Builder::new()
            .name(format!("securesock-accept-{}", local_addr.port()))
            .spawn(move || accept_loop.run())?;

        tracing::info!(addr = %local_addr, "secure server listening");

        Ok(SecureServer {
            local_addr,
            stop,
            accept_thread: Some(accept_thread),
        })
    }
}

struct AcceptLoop {
    listener: TcpListener,
    acceptor: Acceptor,
    stop: Arc<AtomicBool>,
    handler: Arc<ConnectionHandler>,
    on_error: Option<Arc<ErrorHandler>>,
    on_alive: Option<Arc<AliveHandler>>,
}

impl AcceptLoop {
    fn run(self) {
        while !self.stop.load(Ordering::Acquire) {
            match self.acceptor.accept(&self.listener) {
                Ok(Accepted { session, peer_addr }) => self.dispatch(session, peer_addr),
                Err(TlsError::Timeout) => {
                    if let Some(alive) = &self.on_alive {
                        alive();
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "accept failed");
                    if let Some(on_error) = &self.on_error {
                        on_error(&err);
                    }
                    if matches!(err, TlsError::Configuration(_)) {
                        tracing::warn!(error = %err, "accept loop stopped");
                        break;
                    }
                }
            }
        }
        tracing::debug!("accept loop finished");
    }

    fn dispatch(&self, session: TlsSession, peer_addr: SocketAddr) {
        let handler = Arc::clone(&self.handler);
        let spawned = thread::Builder::new()
            .name(format!("securesock-conn-{}", peer_addr))
            .spawn(move || handler(session, peer_addr));

        if let Err(e) = spawned {
            let err = TlsError::Io(e);
            tracing::warn!(peer = %peer_addr, error = %err, "cannot start connection thread");
            if let Some(on_error) = &self.on_error {
                on_error(&err);
            }
        }
    }
}

/// A running TLS server
pub struct SecureServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl SecureServer {
    /// Start configuring a server for `context`
    pub fn builder(context: SecureContext) -> ServerBuilder {
        ServerBuilder {
            config: ServerConfig::default(),
            acceptor: Acceptor::new(context),
            on_error: None,
            on_alive: None,
        }
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the accept thread is still running
    pub fn is_running(&self) -> bool {
        self.accept_thread
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop accepting and wait for the accept thread
    ///
    /// Sessions already handed to the connection handler are not affected.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                tracing::warn!("accept thread panicked");
            }
        }
    }
}

impl Drop for SecureServer {
    fn drop(&mut self) {
        self.stop();
    }
}
