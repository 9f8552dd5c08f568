//! Secure context
//!
//! A [`SecureContext`] owns the cryptographic configuration shared by every
//! session created from it: certificate, private key, trusted-peer store,
//! peer verification policy and the SNI domain table. It is mutable until
//! the first session uses it; from then on it is frozen and every setter
//! fails with [`TlsError::Configuration`].
//!
//! Cloning a context shares it. The OpenSSL context is released when the
//! last clone and the last session built from it are gone.

use super::cert::Certificate;
use super::error::TlsError;
use super::sni::{self, DomainTable};
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Encoding of a certificate or key file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEncoding {
    /// Text PEM
    Pem,
    /// Binary DER
    Der,
}

/// A certificate or key file together with its declared encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFile {
    pub path: PathBuf,
    pub encoding: FileEncoding,
}

impl EncodedFile {
    /// File at `path` in `encoding`
    pub fn new(path: impl Into<PathBuf>, encoding: FileEncoding) -> Self {
        EncodedFile {
            path: path.into(),
            encoding,
        }
    }

    /// Text PEM file
    pub fn pem(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FileEncoding::Pem)
    }

    /// Binary DER file
    pub fn der(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FileEncoding::Der)
    }

    pub(crate) fn read(&self) -> Result<Vec<u8>, TlsError> {
        fs::read(&self.path)
            .map_err(|e| TlsError::Configuration(format!("{}: {}", self.path.display(), e)))
    }
}

/// A certificate file and its private key file, checked to belong together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateAndKeyFiles {
    pub certificate: EncodedFile,
    pub private_key: EncodedFile,
}

impl CertificateAndKeyFiles {
    /// Load both files and fail unless the key matches the certificate
    pub fn new(certificate: EncodedFile, private_key: EncodedFile) -> Result<Self, TlsError> {
        let (cert, _) = load_certificate_chain(&certificate)?;
        let key = load_private_key(&private_key)?;
        if !cert.matches_key(&key) {
            return Err(TlsError::config(format!(
                "Private key {} does not match certificate {}",
                private_key.path.display(),
                certificate.path.display()
            )));
        }
        Ok(CertificateAndKeyFiles {
            certificate,
            private_key,
        })
    }

    /// PEM certificate and key; both may name the same file
    pub fn pem(certificate: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Result<Self, TlsError> {
        Self::new(EncodedFile::pem(certificate), EncodedFile::pem(private_key))
    }
}

/// Which end of the connection a context serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Default)]
struct ContextConfig {
    certificate: Option<Certificate>,
    chain: Vec<Certificate>,
    private_key: Option<PKey<Private>>,
    trusted: Vec<Certificate>,
    trusted_locations: Vec<PathBuf>,
    verify_peer: bool,
    domains: Vec<SecureContext>,
}

#[derive(Default)]
struct ContextState {
    config: ContextConfig,
    frozen: Option<SslContext>,
}

struct ContextInner {
    role: Role,
    state: Mutex<ContextState>,
}

/// Shared TLS configuration for a server or client
#[derive(Clone)]
pub struct SecureContext {
    inner: Arc<ContextInner>,
}

impl SecureContext {
    /// Create an empty context for `role`
    pub fn new(role: Role) -> Self {
        SecureContext {
            inner: Arc::new(ContextInner {
                role,
                state: Mutex::new(ContextState::default()),
            }),
        }
    }

    /// Empty server context
    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Empty client context
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Side of the handshake this context serves
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Load a certificate file; a PEM file may carry the chain after the
    /// leaf certificate
    pub fn install_certificate(&self, file: &EncodedFile) -> Result<(), TlsError> {
        let (certificate, chain) = load_certificate_chain(file)?;
        self.configure("install a certificate", |config| {
            config.certificate = Some(certificate);
            config.chain = chain;
            Ok(())
        })
    }

    /// Use an in-memory certificate
    pub fn use_certificate(&self, certificate: Certificate) -> Result<(), TlsError> {
        self.configure("install a certificate", |config| {
            config.certificate = Some(certificate);
            config.chain.clear();
            Ok(())
        })
    }

    /// Load the private key for the installed certificate
    pub fn install_private_key(&self, file: &EncodedFile) -> Result<(), TlsError> {
        let key = load_private_key(file)?;
        self.use_private_key(key)
    }

    /// Use an in-memory private key
    pub fn use_private_key(&self, key: PKey<Private>) -> Result<(), TlsError> {
        self.configure("install a private key", |config| {
            config.private_key = Some(key);
            Ok(())
        })
    }

    /// Fail unless the installed private key belongs to the installed
    /// certificate
    pub fn verify_key_pair_matches(&self) -> Result<(), TlsError> {
        let state = self.inner.state.lock();
        check_key_pair(&state.config)
    }

    /// Trust the certificate(s) in a file, or every certificate file in a
    /// directory
    ///
    /// Files inside a directory that hold no parsable certificate are
    /// skipped. A file given directly must parse, as PEM (one or more
    /// certificates) or DER.
    pub fn add_trusted_peer_location(&self, path: impl AsRef<Path>) -> Result<(), TlsError> {
        let path = path.as_ref();
        let metadata = fs::metadata(path).map_err(|e| {
            TlsError::config(format!("Trusted peer location {}: {}", path.display(), e))
        })?;

        let certificates = if metadata.is_dir() {
            load_trust_directory(path)?
        } else {
            load_trust_file(path)?
        };

        tracing::debug!(
            location = %path.display(),
            count = certificates.len(),
            "added trusted peer location"
        );

        let location = path.to_path_buf();
        self.configure("add a trusted peer location", |config| {
            config.trusted.extend(certificates);
            config.trusted_locations.push(location);
            Ok(())
        })
    }

    /// Require the peer to present a certificate that verifies against the
    /// trusted peer locations
    pub fn enable_peer_verification(&self) -> Result<(), TlsError> {
        self.configure("enable peer verification", |config| {
            config.verify_peer = true;
            Ok(())
        })
    }

    /// Serve `domain` for SNI host names its certificate matches
    ///
    /// Domains are consulted in insertion order, first match wins. The
    /// domain context must be a server context with a matching certificate
    /// and key, and must not carry domains of its own. All domains must be
    /// added before the first session uses this context.
    pub fn add_domain(&self, domain: &SecureContext) -> Result<(), TlsError> {
        if self.role() != Role::Server || domain.role() != Role::Server {
            return Err(TlsError::config("Domains can only be added between server contexts"));
        }
        if Arc::ptr_eq(&self.inner, &domain.inner) {
            return Err(TlsError::config("A context cannot be its own domain"));
        }

        {
            let state = domain.inner.state.lock();
            if state.config.certificate.is_none() {
                return Err(TlsError::config("Domain context has no certificate"));
            }
            check_key_pair(&state.config)?;
            if !state.config.domains.is_empty() {
                return Err(TlsError::config("Domain context has domains of its own"));
            }
        }

        let domain = domain.clone();
        self.configure("add a domain", |config| {
            config.domains.push(domain);
            Ok(())
        })
    }

    /// Installed certificate
    pub fn certificate(&self) -> Option<Certificate> {
        self.inner.state.lock().config.certificate.clone()
    }

    /// Whether the peer must present a verified certificate
    pub fn peer_verification_enabled(&self) -> bool {
        self.inner.state.lock().config.verify_peer
    }

    /// Trusted peer files and directories, in the order added
    pub fn trusted_peer_locations(&self) -> Vec<PathBuf> {
        self.inner.state.lock().config.trusted_locations.clone()
    }

    /// Number of SNI domain contexts
    pub fn domain_count(&self) -> usize {
        self.inner.state.lock().config.domains.len()
    }

    /// Whether a session has already used (and thereby frozen) this context
    pub fn is_frozen(&self) -> bool {
        self.inner.state.lock().frozen.is_some()
    }

    /// OpenSSL context for a new session, built and frozen on first use
    ///
    /// This is where role requirements are enforced: a server needs a
    /// certificate and key, a client needs trusted peer locations, and a
    /// server verifying its peers needs them too.
    pub(crate) fn ssl_context(&self) -> Result<SslContext, TlsError> {
        let mut state = self.inner.state.lock();
        if let Some(ctx) = &state.frozen {
            return Ok(ctx.clone());
        }

        let ctx = build_ssl_context(self.role(), &state.config)?;
        tracing::debug!(role = ?self.role(), "secure context frozen");
        state.frozen = Some(ctx.clone());
        Ok(ctx)
    }

    fn configure<R>(
        &self,
        what: &str,
        f: impl FnOnce(&mut ContextConfig) -> Result<R, TlsError>,
    ) -> Result<R, TlsError> {
        let mut state = self.inner.state.lock();
        if state.frozen.is_some() {
            return Err(TlsError::config(format!(
                "Cannot {}: context is already in use",
                what
            )));
        }
        f(&mut state.config)
    }
}

impl std::fmt::Debug for SecureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SecureContext")
            .field("role", &self.inner.role)
            .field("certificate", &state.config.certificate)
            .field("trusted", &state.config.trusted.len())
            .field("verify_peer", &state.config.verify_peer)
            .field("domains", &state.config.domains.len())
            .field("frozen", &state.frozen.is_some())
            .finish()
    }
}

fn check_key_pair(config: &ContextConfig) -> Result<(), TlsError> {
    match (&config.certificate, &config.private_key) {
        (Some(cert), Some(key)) if cert.matches_key(key) => Ok(()),
        (Some(_), Some(_)) => Err(TlsError::config(
            "Private key does not match the certificate",
        )),
        (None, _) => Err(TlsError::config("No certificate installed")),
        (_, None) => Err(TlsError::config("No private key installed")),
    }
}

fn build_ssl_context(role: Role, config: &ContextConfig) -> Result<SslContext, TlsError> {
    let method = match role {
        Role::Server => SslMethod::tls_server(),
        Role::Client => SslMethod::tls_client(),
    };
    let mut builder = SslContextBuilder::new(method)?;
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;

    match (&config.certificate, &config.private_key) {
        (Some(_), Some(key)) => {
            check_key_pair(config)?;
            if let Some(cert) = &config.certificate {
                builder.set_certificate(cert.as_x509())?;
            }
            for extra in &config.chain {
                builder.add_extra_chain_cert(extra.as_x509().to_owned())?;
            }
            builder.set_private_key(key)?;
            builder.check_private_key()?;
        }
        (None, None) if role == Role::Client => {}
        (None, None) => {
            return Err(TlsError::config("Server context has no certificate and key"));
        }
        (Some(_), None) => return Err(TlsError::config("Certificate installed without a private key")),
        (None, Some(_)) => return Err(TlsError::config("Private key installed without a certificate")),
    }

    for cert in &config.trusted {
        builder.cert_store_mut().add_cert(cert.as_x509().to_owned())?;
    }

    match role {
        Role::Client => {
            if config.trusted.is_empty() {
                return Err(TlsError::config(
                    "Client context has no trusted peer certificates",
                ));
            }
            // Chain and hostname checks run after the handshake so that an
            // override can be consulted.
            builder.set_verify(SslVerifyMode::NONE);
        }
        Role::Server if config.verify_peer => {
            if config.trusted.is_empty() {
                return Err(TlsError::config(
                    "Peer verification enabled without trusted peer certificates",
                ));
            }
            builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
            builder.set_session_id_context(b"securesock")?;
        }
        Role::Server => builder.set_verify(SslVerifyMode::NONE),
    }

    if role == Role::Server && !config.domains.is_empty() {
        let table = DomainTable::build(config.certificate.clone(), &config.domains)?;
        sni::install(&mut builder, table);
    }

    Ok(builder.build())
}

fn load_certificate_chain(file: &EncodedFile) -> Result<(Certificate, Vec<Certificate>), TlsError> {
    match file.encoding {
        FileEncoding::Der => Ok((Certificate::load(file)?, Vec::new())),
        FileEncoding::Pem => {
            let bytes = file.read()?;
            let mut stack = X509::stack_from_pem(&bytes)
                .map_err(|e| TlsError::config(format!("{}: {}", file.path.display(), e)))?
                .into_iter()
                .map(Certificate::from_x509);
            let leaf = stack.next().ok_or_else(|| {
                TlsError::config(format!("{}: no certificate found", file.path.display()))
            })?;
            Ok((leaf, stack.collect()))
        }
    }
}

fn load_private_key(file: &EncodedFile) -> Result<PKey<Private>, TlsError> {
    let bytes = file.read()?;
    let key = match file.encoding {
        FileEncoding::Pem => PKey::private_key_from_pem(&bytes),
        FileEncoding::Der => PKey::private_key_from_der(&bytes),
    };
    key.map_err(|e| {
        TlsError::config(format!(
            "{}: cannot parse private key: {}",
            file.path.display(),
            e
        ))
    })
}

fn parse_certificates(bytes: &[u8]) -> Option<Vec<Certificate>> {
    if let Ok(stack) = X509::stack_from_pem(bytes) {
        if !stack.is_empty() {
            return Some(stack.into_iter().map(Certificate::from_x509).collect());
        }
    }
    X509::from_der(bytes)
        .ok()
        .map(|x509| vec![Certificate::from_x509(x509)])
}

fn load_trust_file(path: &Path) -> Result<Vec<Certificate>, TlsError> {
    let bytes = fs::read(path)
        .map_err(|e| TlsError::config(format!("Trusted peer location {}: {}", path.display(), e)))?;
    parse_certificates(&bytes).ok_or_else(|| {
        TlsError::config(format!(
            "Trusted peer location {}: no certificate found",
            path.display()
        ))
    })
}

fn load_trust_directory(path: &Path) -> Result<Vec<Certificate>, TlsError> {
    let entries = fs::read_dir(path)
        .map_err(|e| TlsError::config(format!("Trusted peer location {}: {}", path.display(), e)))?;

    let mut certificates = Vec::new();
    for entry in entries {
        let entry_path = entry?.path();
        if !entry_path.is_file() {
            continue;
        }
        match fs::read(&entry_path).ok().and_then(|bytes| parse_certificates(&bytes)) {
            Some(found) => certificates.extend(found),
            None => tracing::debug!(file = %entry_path.display(), "skipping non-certificate file"),
        }
    }
    Ok(certificates)
}
