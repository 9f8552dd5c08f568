//! SNI certificate selection
//!
//! A server context with domains answers the client's requested host name
//! with the first matching certificate: its own if it matches, otherwise
//! the first domain context (in insertion order) whose certificate matches.
//! A host name nothing matches is not acknowledged and the handshake goes
//! on with the default certificate.
//!
//! The table is frozen together with its parent context, so dispatch never
//! observes concurrent mutation.

use super::cert::Certificate;
use super::context::SecureContext;
use super::error::TlsError;
use openssl::ssl::{NameType, SniError, SslContext, SslContextBuilder, SslRef};

/// One servable domain: its certificate and its frozen OpenSSL context
pub(crate) struct DomainEntry {
    certificate: Certificate,
    ssl: SslContext,
}

/// Outcome of looking up a requested host name
pub(crate) enum SniSelection<'a> {
    /// The parent context's own certificate already matches
    Default,
    /// Rebind the handshake to this domain
    Domain(&'a DomainEntry),
    /// Nothing matches
    NoMatch,
}

/// Host name to context dispatch table
pub(crate) struct DomainTable {
    own: Option<Certificate>,
    entries: Vec<DomainEntry>,
}

impl DomainTable {
    /// Freeze every domain context and record its certificate
    pub(crate) fn build(own: Option<Certificate>, domains: &[SecureContext]) -> Result<Self, TlsError> {
        let mut entries = Vec::with_capacity(domains.len());
        for domain in domains {
            let certificate = domain
                .certificate()
                .ok_or_else(|| TlsError::config("Domain context has no certificate"))?;
            let ssl = domain.ssl_context()?;
            entries.push(DomainEntry { certificate, ssl });
        }
        Ok(DomainTable { own, entries })
    }

    pub(crate) fn resolve(&self, hostname: &str) -> SniSelection<'_> {
        if self
            .own
            .as_ref()
            .is_some_and(|cert| cert.matches_hostname(hostname))
        {
            return SniSelection::Default;
        }

        match self
            .entries
            .iter()
            .find(|entry| entry.certificate.matches_hostname(hostname))
        {
            Some(entry) => SniSelection::Domain(entry),
            None => SniSelection::NoMatch,
        }
    }

    /// Act on the host name the client requested in `ssl`'s ClientHello
    fn dispatch(&self, ssl: &mut SslRef) -> Result<(), SniError> {
        let hostname = match ssl.servername(NameType::HOST_NAME) {
            Some(name) => name.to_string(),
            None => return Err(SniError::NOACK),
        };

        match self.resolve(&hostname) {
            SniSelection::Default => {
                tracing::debug!(%hostname, "sni: default certificate matches");
                Ok(())
            }
            SniSelection::Domain(entry) => {
                if let Err(e) = ssl.set_ssl_context(&entry.ssl) {
                    tracing::warn!(%hostname, error = %e, "sni: failed to switch context");
                    return Err(SniError::NOACK);
                }
                tracing::debug!(
                    %hostname,
                    certificate = ?entry.certificate.common_name(),
                    "sni: switched to domain context"
                );
                Ok(())
            }
            SniSelection::NoMatch => {
                tracing::debug!(%hostname, "sni: no certificate matches, continuing with default");
                Err(SniError::NOACK)
            }
        }
    }
}

/// Install the dispatch callback on a server context under construction
pub(crate) fn install(builder: &mut SslContextBuilder, table: DomainTable) {
    builder.set_servername_callback(move |ssl, _alert| table.dispatch(ssl));
}
