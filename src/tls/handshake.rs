//! Handshake deadlines and client-side peer verification

use super::cert::Certificate;
use super::channel::SecureChannel;
use super::error::TlsError;
use std::time::Duration;

/// Default handshake timeout, covering TCP accept/connect as well
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Default per-operation read/write timeout
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Application decision on a peer certificate that failed verification
///
/// Returning `true` accepts the certificate anyway (pinning, manual trust).
pub type VerificationOverride = dyn Fn(&Certificate) -> bool + Send + Sync;

pub fn default_handshake_timeout() -> Duration {
    Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS)
}

pub(crate) use crate::net::deadline_after;

/// Decide whether the server a client just shook hands with is acceptable
///
/// A missing certificate is always rejected and the override is not
/// consulted. A certificate that fails chain or hostname verification is
/// accepted only when `verification_override` returns `true`.
pub(crate) fn verify_peer<C: SecureChannel>(
    channel: &C,
    verification_override: Option<&VerificationOverride>,
) -> Result<Certificate, TlsError> {
    let certificate = channel
        .peer_certificate()
        .ok_or_else(|| TlsError::Rejected("no certificate".to_string()))?;

    let reason = match channel.verify_result() {
        Ok(()) => return Ok(certificate),
        Err(reason) => reason,
    };

    match verification_override {
        Some(decide) if decide(&certificate) => {
            tracing::warn!(
                peer = ?certificate.common_name(),
                %reason,
                "peer certificate accepted by verification override"
            );
            Ok(certificate)
        }
        _ => Err(TlsError::Rejected(reason)),
    }
}
