//! Connect engine
//!
//! TCP connect, client handshake with SNI, then verification of the server
//! certificate with an optional application override.

use super::cert::Certificate;
use super::channel::OpenSslChannel;
use super::context::{CertificateAndKeyFiles, Role, SecureContext};
use super::error::TlsError;
use super::handshake::{self, VerificationOverride, DEFAULT_IO_TIMEOUT};
use super::session::{SecureSession, TlsSession};
use crate::net;
use parking_lot::Mutex;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Client-side connection factory
///
/// Needs either trusted peer locations or a context that already has them.
/// The context is configured on the first `connect` and reused by every
/// later one.
#[derive(Clone)]
pub struct Connector {
    hostname: Option<String>,
    timeout: Duration,
    io_timeout: Duration,
    context: Option<SecureContext>,
    certificate_files: Option<CertificateAndKeyFiles>,
    trusted_locations: Vec<PathBuf>,
    verification_override: Option<Arc<VerificationOverride>>,
    prepared: Arc<Mutex<Option<SecureContext>>>,
}

impl Default for Connector {
    fn default() -> Self {
        Connector {
            hostname: None,
            timeout: handshake::default_handshake_timeout(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            context: None,
            certificate_files: None,
            trusted_locations: Vec::new(),
            verification_override: None,
            prepared: Arc::default(),
        }
    }
}

impl Connector {
    /// Create a connector with default timeouts
    pub fn new() -> Self {
        Self::default()
    }

    /// Host name sent as SNI and checked against the server certificate
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Bound on the TCP connect plus the handshake
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Read/write timeout of the established session
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Use a prepared client context instead of a fresh one
    pub fn context(mut self, context: SecureContext) -> Self {
        self.context = Some(context);
        self.prepared = Arc::default();
        self
    }

    /// Present this certificate to servers that ask for one
    pub fn certificate_files(mut self, files: CertificateAndKeyFiles) -> Self {
        self.certificate_files = Some(files);
        self.prepared = Arc::default();
        self
    }

    /// Trust certificates from a file or directory
    pub fn trusted_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.trusted_locations.push(path.into());
        self.prepared = Arc::default();
        self
    }

    /// Decide on server certificates that fail verification
    pub fn verification_override<F>(mut self, decide: F) -> Self
    where
        F: Fn(&Certificate) -> bool + Send + Sync + 'static,
    {
        self.verification_override = Some(Arc::new(decide));
        self
    }

    /// Connect to `address:port` and complete a verified handshake
    pub fn connect(&self, address: &str, port: u16) -> Result<TlsSession, TlsError> {
        let deadline = handshake::deadline_after(self.timeout);
        let context = self.prepared_context()?;
        let ssl_context = context.ssl_context()?;

        let stream = net::connect_tcp(address, port, self.timeout).map_err(|e| {
            if e.kind() == io::ErrorKind::TimedOut {
                TlsError::Timeout
            } else {
                TlsError::Io(e)
            }
        })?;

        let channel = OpenSslChannel::client(&ssl_context, stream, self.hostname.as_deref())?;
        let mut session = SecureSession::new(channel, context);
        session.set_io_timeout(self.io_timeout);

        if let Err(e) = session.perform_client_handshake(deadline, self.verification_override.as_deref()) {
            tracing::debug!(%address, port, error = %e, "client handshake failed");
            return Err(e);
        }

        tracing::debug!(%address, port, hostname = ?self.hostname, "connected secure session");
        Ok(session)
    }

    /// The configured context, prepared on first use
    fn prepared_context(&self) -> Result<SecureContext, TlsError> {
        let mut prepared = self.prepared.lock();
        if let Some(context) = prepared.as_ref() {
            return Ok(context.clone());
        }
        let context = self.prepare_context()?;
        *prepared = Some(context.clone());
        Ok(context)
    }

    /// The context to connect with, configured from this builder
    ///
    /// Fails when there is neither a trusted peer location nor a context.
    fn prepare_context(&self) -> Result<SecureContext, TlsError> {
        if self.trusted_locations.is_empty() && self.context.is_none() {
            return Err(TlsError::config(
                "Connecting needs trusted peer locations or a prepared client context",
            ));
        }

        let context = match &self.context {
            Some(context) => context.clone(),
            None => SecureContext::client(),
        };
        if context.role() != Role::Client {
            return Err(TlsError::config("Cannot connect with a server context"));
        }

        if let Some(files) = &self.certificate_files {
            context.install_certificate(&files.certificate)?;
            context.install_private_key(&files.private_key)?;
            context.verify_key_pair_matches()?;
        }
        for location in &self.trusted_locations {
            context.add_trusted_peer_location(location)?;
        }
        if !self.trusted_locations.is_empty() {
            context.enable_peer_verification()?;
        }

        Ok(context)
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("hostname", &self.hostname)
            .field("timeout", &self.timeout)
            .field("context", &self.context)
            .field("trusted_locations", &self.trusted_locations)
            .field("verification_override", &self.verification_override.is_some())
            .finish()
    }
}
