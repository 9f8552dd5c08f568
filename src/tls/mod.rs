//! TLS session engine
//!
//! This module drives OpenSSL secure channels over blocking-style sockets
//! with explicit deadlines: a server accepts and shakes hands, a client
//! connects, shakes hands and verifies the server certificate.
//!
//! # Architecture
//!
//! 1. [`SecureContext`] holds certificate, key, trusted peers and the SNI
//!    domain table. It freezes when the first session uses it.
//! 2. [`SecureSession`] runs the handshake/read/write state machine over a
//!    [`SecureChannel`], retrying would-block outcomes after a readiness
//!    wait until the operation's deadline.
//! 3. [`Acceptor`] and [`Connector`] compose TCP accept/connect, session
//!    creation, handshake and (client side) peer verification.
//!
//! # Features
//!
//! - TLS 1.2 and TLS 1.3 (OpenSSL version dependent)
//! - PEM and DER certificates and keys, with an explicit key pair check
//! - Trusted peer files and directories, pinned leaf certificates included
//! - SNI certificate selection across several server identities
//! - Client verification override for pinning and manual trust
//! - Client certificates (mutual TLS)
//!
//! # Examples
//!
//! ## Server
//!
//! ```no_run
//! use securesock::tls::{Acceptor, EncodedFile, SecureContext};
//! use securesock::net::bind_listener;
//! use std::time::Duration;
//!
//! let context = SecureContext::server();
//! context.install_certificate(&EncodedFile::pem("server.pem")).unwrap();
//! context.install_private_key(&EncodedFile::pem("server.key")).unwrap();
//! context.verify_key_pair_matches().unwrap();
//!
//! let listener = bind_listener("127.0.0.1:8443".parse().unwrap(), 20).unwrap();
//! let acceptor = Acceptor::new(context).timeout(Duration::from_secs(5));
//! let mut accepted = acceptor.accept(&listener).unwrap();
//! accepted.session.write_all(b"hello\n").unwrap();
//! ```
//!
//! ## Client
//!
//! ```no_run
//! use securesock::tls::Connector;
//!
//! let mut session = Connector::new()
//!     .hostname("example.com")
//!     .trusted_location("/etc/ssl/certs")
//!     .connect("example.com", 443)
//!     .unwrap();
//!
//! let mut buf = [0u8; 1024];
//! let n = session.read(&mut buf).unwrap();
//! println!("{:?}", session.peer_certificate().and_then(|c| c.common_name()));
//! # let _ = n;
//! ```

pub mod accept;
pub mod builtin_cert;
pub mod cert;
pub mod channel;
pub mod connect;
pub mod context;
pub mod error;
pub mod handshake;
pub mod info;
pub mod receiver;
pub mod session;
mod sni;

pub use accept::{Accepted, Acceptor};
pub use cert::{Certificate, CertificateBuilder, DistinguishedName, NameField, Validity};
pub use channel::{ChannelFault, OpenSslChannel, Progress, SecureChannel};
pub use connect::Connector;
pub use context::{CertificateAndKeyFiles, EncodedFile, FileEncoding, Role, SecureContext};
pub use error::TlsError;
pub use handshake::{VerificationOverride, DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_IO_TIMEOUT};
pub use info::SessionInfo;
pub use receiver::{ReceiveEnd, Receiver, DEFAULT_RECEIVE_BUFFER_SIZE};
pub use session::{SecureSession, SessionState, TlsSession};

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
