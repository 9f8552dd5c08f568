//! Secure-channel primitive
//!
//! [`SecureChannel`] is the seam between the session state machine and the
//! TLS library. Every primitive call reports one [`Progress`] value, so
//! handshake, read and write share a single outcome model.
//! [`OpenSslChannel`] implements it over a non-blocking `TcpStream`.

use super::cert::Certificate;
use super::error::TlsError;
use openssl::ssl::{ErrorCode, Ssl, SslContextRef, SslRef, SslStream};
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::X509VerifyResult;
use std::io;
use std::net::{IpAddr, Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

/// Outcome of one call into the secure-channel primitive
#[derive(Debug)]
pub enum Progress {
    /// The call completed, transferring this many bytes (0 for a handshake)
    Done(usize),
    /// Nothing fatal happened, retry once the socket is readable
    WantRead,
    /// Nothing fatal happened, retry once the socket is writable
    WantWrite,
    /// The peer closed the TLS connection cleanly
    ZeroReturn,
    /// Anything else; never retried
    Fatal(ChannelFault),
}

/// Fatal condition reported by the primitive
#[derive(Debug)]
pub enum ChannelFault {
    /// The TLS library rejected the peer's data or our configuration
    Protocol(String),
    /// The transport failed underneath the TLS library
    Io(io::Error),
    /// A result code the library does not document for this call
    Unexpected(String),
}

impl From<ChannelFault> for TlsError {
    fn from(fault: ChannelFault) -> Self {
        match fault {
            ChannelFault::Protocol(msg) => TlsError::Protocol(msg),
            ChannelFault::Io(err) => TlsError::Io(err),
            ChannelFault::Unexpected(msg) => TlsError::Protocol(msg),
        }
    }
}

/// Secure-channel primitive driven by [`SecureSession`](super::SecureSession)
///
/// A retried call after `WantRead`/`WantWrite` is always made with the same
/// arguments as the call that asked for the retry.
pub trait SecureChannel {
    fn handshake(&mut self) -> Progress;

    fn read(&mut self, buf: &mut [u8]) -> Progress;

    fn write(&mut self, buf: &[u8]) -> Progress;

    /// Send close_notify; a single best-effort attempt
    fn shutdown(&mut self);

    /// Shut down the transport in both directions
    fn close_transport(&mut self);

    /// Certificate presented by the peer, if any
    fn peer_certificate(&self) -> Option<Certificate>;

    /// Result of the chain (and hostname) verification run during the
    /// handshake
    fn verify_result(&self) -> Result<(), String>;

    /// Socket used for readiness waits
    fn raw_fd(&self) -> RawFd;
}

/// OpenSSL secure channel over a non-blocking TCP stream
pub struct OpenSslChannel {
    stream: SslStream<TcpStream>,
}

impl OpenSslChannel {
    /// Prepare the server side of a connection
    pub fn server(ctx: &SslContextRef, stream: TcpStream) -> Result<Self, TlsError> {
        let mut ssl = Ssl::new(ctx)?;
        ssl.set_accept_state();
        Self::wrap(ssl, stream)
    }

    /// Prepare the client side of a connection
    ///
    /// A DNS `hostname` is sent as SNI and checked against the peer
    /// certificate; an IP literal is only checked.
    pub fn client(
        ctx: &SslContextRef,
        stream: TcpStream,
        hostname: Option<&str>,
    ) -> Result<Self, TlsError> {
        let mut ssl = Ssl::new(ctx)?;
        ssl.set_connect_state();

        if let Some(hostname) = hostname {
            match hostname.parse::<IpAddr>() {
                Ok(ip) => ssl.param_mut().set_ip(ip)?,
                Err(_) => {
                    ssl.set_hostname(hostname)?;
                    ssl.param_mut().set_host(hostname)?;
                }
            }
        }

        Self::wrap(ssl, stream)
    }

    fn wrap(mut ssl: Ssl, stream: TcpStream) -> Result<Self, TlsError> {
        // Trusted-peer locations hold pinned peer certificates, not only roots.
        ssl.param_mut().set_flags(X509VerifyFlags::PARTIAL_CHAIN)?;
        stream.set_nonblocking(true)?;

        let stream = SslStream::new(ssl, stream)?;
        Ok(OpenSslChannel { stream })
    }

    pub fn ssl(&self) -> &SslRef {
        self.stream.ssl()
    }

    /// Get reference to underlying TCP stream
    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }
}

fn classify(err: openssl::ssl::Error) -> Progress {
    match err.code() {
        ErrorCode::WANT_READ => Progress::WantRead,
        ErrorCode::WANT_WRITE => Progress::WantWrite,
        ErrorCode::ZERO_RETURN => Progress::ZeroReturn,
        ErrorCode::SYSCALL => match err.into_io_error() {
            Ok(io_err) => Progress::Fatal(ChannelFault::Io(io_err)),
            Err(err) => Progress::Fatal(ChannelFault::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection ended without close_notify: {}", err),
            ))),
        },
        ErrorCode::SSL => Progress::Fatal(ChannelFault::Protocol(err.to_string())),
        code => Progress::Fatal(ChannelFault::Unexpected(format!(
            "OpenSSL returned undocumented result code {}",
            code.as_raw()
        ))),
    }
}

impl SecureChannel for OpenSslChannel {
    fn handshake(&mut self) -> Progress {
        match self.stream.do_handshake() {
            Ok(()) => Progress::Done(0),
            Err(e) => classify(e),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Progress {
        match self.stream.ssl_read(buf) {
            Ok(n) => Progress::Done(n),
            Err(e) => classify(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Progress {
        match self.stream.ssl_write(buf) {
            Ok(n) => Progress::Done(n),
            Err(e) => classify(e),
        }
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown() {
            tracing::trace!(error = %e, "close_notify not sent");
        }
    }

    fn close_transport(&mut self) {
        let _ = self.stream.get_mut().shutdown(Shutdown::Both);
    }

    fn peer_certificate(&self) -> Option<Certificate> {
        self.stream.ssl().peer_certificate().map(Certificate::from_x509)
    }

    fn verify_result(&self) -> Result<(), String> {
        let result = self.stream.ssl().verify_result();
        if result.as_raw() == X509VerifyResult::OK.as_raw() {
            Ok(())
        } else {
            Err(format!(
                "certificate verification failed ({}): {}",
                result.as_raw(),
                result.error_string()
            ))
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.get_ref().as_raw_fd()
    }
}
