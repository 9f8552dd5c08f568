//! TLS errors
//!
//! Every fallible operation carries its failure as a [`TlsError`] value.
//! The variants follow the outcome taxonomy shared by accept, connect,
//! read and write.

use super::session::SessionState;
use std::io;

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Operation not permitted in state {0:?}")]
    InvalidState(SessionState),
}

impl TlsError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, TlsError::Timeout | TlsError::ConnectionClosed)
    }

    /// Whether retrying is pointless without changing configuration or
    /// credentials
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(
            self,
            TlsError::Configuration(_)
                | TlsError::Certificate(_)
                | TlsError::OpenSsl(_)
                | TlsError::Rejected(_)
        )
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        TlsError::Configuration(msg.into())
    }
}

impl From<TlsError> for io::Error {
    fn from(err: TlsError) -> Self {
        let kind = match &err {
            TlsError::Io(e) => e.kind(),
            TlsError::Timeout => io::ErrorKind::TimedOut,
            TlsError::ConnectionClosed => io::ErrorKind::ConnectionAborted,
            TlsError::Rejected(_) => io::ErrorKind::PermissionDenied,
            TlsError::InvalidState(_) => io::ErrorKind::NotConnected,
            TlsError::Configuration(_) | TlsError::Certificate(_) => io::ErrorKind::InvalidInput,
            TlsError::OpenSsl(_) | TlsError::Protocol(_) => io::ErrorKind::InvalidData,
        };
        match err {
            TlsError::Io(e) => e,
            other => io::Error::new(kind, other),
        }
    }
}
