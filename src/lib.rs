//! securesock - certificate-authenticated TLS sessions over blocking sockets
//!
//! This crate drives an OpenSSL secure channel from application code:
//! accepting TLS connections as a server (optionally serving several
//! certified domains from one listening socket through SNI) and initiating
//! them as a client (optionally verifying the peer against a trust set and a
//! requested hostname).

pub mod net;
pub mod server;
pub mod tls;

pub use server::{SecureServer, ServerConfig};
pub use tls::{
    Acceptor, Certificate, CertificateBuilder, Connector, Role, SecureContext, SecureSession,
    TlsError, TlsSession,
};
