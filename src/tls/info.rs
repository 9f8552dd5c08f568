//! Negotiated session parameters
//!
//! [`SessionInfo`] is a snapshot of what the handshake settled on, taken
//! from the OpenSSL connection of an established [`TlsSession`].

use super::cert::Certificate;
use super::channel::OpenSslChannel;
use super::session::SecureSession;
use crate::net::ReadinessWait;
use openssl::ssl::{NameType, SslRef};

/// Parameters of a negotiated TLS connection
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Negotiated protocol version (e.g. "TLSv1.3")
    pub version: String,

    /// Negotiated cipher suite
    pub cipher: Option<String>,

    /// SNI host name: the one sent (client) or received (server)
    pub servername: Option<String>,

    /// Whether a previous session was resumed
    pub session_reused: bool,

    /// Certificate presented by the peer
    pub peer_certificate: Option<Certificate>,

    /// Our own certificate as selected for this connection, after any SNI
    /// rebinding
    pub local_certificate: Option<Certificate>,
}

impl SessionInfo {
    pub fn from_ssl(ssl: &SslRef) -> Self {
        SessionInfo {
            version: ssl.version_str().to_string(),
            cipher: ssl.current_cipher().map(|c| c.name().to_string()),
            servername: ssl.servername(NameType::HOST_NAME).map(str::to_string),
            session_reused: ssl.session_reused(),
            peer_certificate: ssl.peer_certificate().map(Certificate::from_x509),
            local_certificate: ssl.certificate().map(Certificate::from_x509_ref),
        }
    }
}

impl<W: ReadinessWait> SecureSession<OpenSslChannel, W> {
    /// Snapshot of the negotiated parameters
    pub fn info(&self) -> SessionInfo {
        SessionInfo::from_ssl(self.channel().ssl())
    }
}
