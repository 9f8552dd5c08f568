//! Certificate handling and parsing
//!
//! This module wraps X.509 certificates obtained from a live session or a
//! context ([`Certificate`], immutable and cheaply cloned) and provides a
//! mutable, not-yet-signed [`CertificateBuilder`] for issuing new ones.

use super::context::{EncodedFile, FileEncoding};
use super::error::TlsError;
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPrivate, HasPublic, PKeyRef};
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509NameRef, X509Ref, X509};
use std::fmt;

/// Seconds in a day, used to convert ASN.1 time differences
const SECS_PER_DAY: i64 = 86_400;

/// Default validity of an issued certificate without an explicit window
const DEFAULT_VALIDITY_SECS: i64 = 365 * SECS_PER_DAY;

/// Identity field of a subject or issuer name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameField {
    CommonName,
    Organization,
    OrganizationalUnit,
    Country,
    StateOrProvince,
    Locality,
    Email,
}

impl NameField {
    const ALL: [NameField; 7] = [
        NameField::CommonName,
        NameField::Organization,
        NameField::OrganizationalUnit,
        NameField::Country,
        NameField::StateOrProvince,
        NameField::Locality,
        NameField::Email,
    ];

    fn nid(self) -> Nid {
        match self {
            NameField::CommonName => Nid::COMMONNAME,
            NameField::Organization => Nid::ORGANIZATIONNAME,
            NameField::OrganizationalUnit => Nid::ORGANIZATIONALUNITNAME,
            NameField::Country => Nid::COUNTRYNAME,
            NameField::StateOrProvince => Nid::STATEORPROVINCENAME,
            NameField::Locality => Nid::LOCALITYNAME,
            NameField::Email => Nid::PKCS9_EMAILADDRESS,
        }
    }
}

/// Subject or issuer identity fields
///
/// Every field is optional: not every certificate carries every field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistinguishedName {
    pub common_name: Option<String>,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
    pub country: Option<String>,
    pub state_or_province: Option<String>,
    pub locality: Option<String>,
    pub email: Option<String>,
}

impl DistinguishedName {
    fn from_x509_name(name: &X509NameRef) -> Self {
        let get = |field: NameField| {
            name.entries_by_nid(field.nid())
                .next()
                .and_then(|entry| entry.data().to_string().ok())
        };

        DistinguishedName {
            common_name: get(NameField::CommonName),
            organization: get(NameField::Organization),
            organizational_unit: get(NameField::OrganizationalUnit),
            country: get(NameField::Country),
            state_or_province: get(NameField::StateOrProvince),
            locality: get(NameField::Locality),
            email: get(NameField::Email),
        }
    }

    fn from_fields(fields: &[(NameField, String)]) -> Self {
        let mut name = DistinguishedName::default();
        for (field, value) in fields {
            *name.slot(*field) = Some(value.clone());
        }
        name
    }

    fn slot(&mut self, field: NameField) -> &mut Option<String> {
        match field {
            NameField::CommonName => &mut self.common_name,
            NameField::Organization => &mut self.organization,
            NameField::OrganizationalUnit => &mut self.organizational_unit,
            NameField::Country => &mut self.country,
            NameField::StateOrProvince => &mut self.state_or_province,
            NameField::Locality => &mut self.locality,
            NameField::Email => &mut self.email,
        }
    }

    /// Get a field by kind
    pub fn get(&self, field: NameField) -> Option<&str> {
        match field {
            NameField::CommonName => self.common_name.as_deref(),
            NameField::Organization => self.organization.as_deref(),
            NameField::OrganizationalUnit => self.organizational_unit.as_deref(),
            NameField::Country => self.country.as_deref(),
            NameField::StateOrProvince => self.state_or_province.as_deref(),
            NameField::Locality => self.locality.as_deref(),
            NameField::Email => self.email.as_deref(),
        }
    }
}

/// Validity window in seconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: i64,
    pub not_after: i64,
}

impl Validity {
    /// Whether `epoch_secs` lies inside the window
    pub fn contains(&self, epoch_secs: i64) -> bool {
        self.not_before <= epoch_secs && epoch_secs <= self.not_after
    }
}

/// Immutable X.509 certificate
///
/// Cloning shares the underlying certificate (reference counted); it is
/// released when the last clone is dropped.
#[derive(Clone)]
pub struct Certificate {
    x509: X509,
}

impl Certificate {
    /// Wrap an OpenSSL certificate
    pub fn from_x509(x509: X509) -> Self {
        Certificate { x509 }
    }

    /// Wrap a borrowed OpenSSL certificate, taking a new reference
    pub fn from_x509_ref(x509: &X509Ref) -> Self {
        Certificate {
            x509: x509.to_owned(),
        }
    }

    /// Parse the first certificate of a PEM document
    pub fn from_pem(pem: &[u8]) -> Result<Self, TlsError> {
        X509::from_pem(pem)
            .map(Certificate::from_x509)
            .map_err(|e| TlsError::Certificate(format!("Failed to parse PEM certificate: {}", e)))
    }

    /// Parse a DER encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self, TlsError> {
        X509::from_der(der)
            .map(Certificate::from_x509)
            .map_err(|e| TlsError::Certificate(format!("Failed to parse DER certificate: {}", e)))
    }

    /// Load a certificate file in the declared encoding
    pub fn load(file: &EncodedFile) -> Result<Self, TlsError> {
        let bytes = file.read()?;
        let parsed = match file.encoding {
            FileEncoding::Pem => Self::from_pem(&bytes),
            FileEncoding::Der => Self::from_der(&bytes),
        };
        parsed.map_err(|e| TlsError::Configuration(format!("{}: {}", file.path.display(), e)))
    }

    /// Encode as PEM
    pub fn to_pem(&self) -> Result<Vec<u8>, TlsError> {
        Ok(self.x509.to_pem()?)
    }

    /// Encode as DER
    pub fn to_der(&self) -> Result<Vec<u8>, TlsError> {
        Ok(self.x509.to_der()?)
    }

    /// Underlying OpenSSL certificate
    pub fn as_x509(&self) -> &X509Ref {
        &self.x509
    }

    /// Subject name fields
    pub fn subject(&self) -> DistinguishedName {
        DistinguishedName::from_x509_name(self.x509.subject_name())
    }

    /// Issuer name fields
    pub fn issuer(&self) -> DistinguishedName {
        DistinguishedName::from_x509_name(self.x509.issuer_name())
    }

    /// Subject common name
    pub fn common_name(&self) -> Option<String> {
        self.subject().common_name
    }

    /// DNS entries of the subject alternative name extension
    pub fn subject_alt_names(&self) -> Vec<String> {
        self.x509
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.dnsname().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Serial number as upper-case hex
    pub fn serial_number(&self) -> Option<String> {
        let bn = self.x509.serial_number().to_bn().ok()?;
        let hex = bn.to_hex_str().ok()?;
        Some(hex.to_string())
    }

    /// Validity window, if both times convert
    pub fn validity(&self) -> Option<Validity> {
        Some(Validity {
            not_before: epoch_seconds(self.x509.not_before())?,
            not_after: epoch_seconds(self.x509.not_after())?,
        })
    }

    /// Wildcard-aware match of `hostname` against the common name and every
    /// DNS subject alternative name
    pub fn matches_hostname(&self, hostname: &str) -> bool {
        let alt_match = self
            .subject_alt_names()
            .iter()
            .any(|pattern| hostname_matches(pattern, hostname));

        alt_match
            || self
                .common_name()
                .is_some_and(|cn| hostname_matches(&cn, hostname))
    }

    /// Whether `key` is the private half of this certificate's public key
    pub fn matches_key<T: HasPrivate>(&self, key: &PKeyRef<T>) -> bool {
        match self.x509.public_key() {
            Ok(public) => public.public_eq(key),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.common_name())
            .field("serial", &self.serial_number())
            .finish()
    }
}

fn epoch_seconds(time: &Asn1TimeRef) -> Option<i64> {
    let epoch = Asn1Time::from_unix(0).ok()?;
    let diff = epoch.diff(time).ok()?;
    Some(i64::from(diff.days) * SECS_PER_DAY + i64::from(diff.secs))
}

/// Wildcard-aware hostname comparison
///
/// Matching is ASCII case-insensitive and ignores a trailing dot. A wildcard
/// is only honoured as the complete left-most label (`*.example.com`), covers
/// exactly one label and needs at least two labels after it.
pub fn hostname_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    let hostname = hostname.trim_end_matches('.');
    if pattern.is_empty() || hostname.is_empty() {
        return false;
    }

    if let Some(suffix) = pattern.strip_prefix("*.") {
        if !suffix.contains('.') || suffix.contains('*') {
            return false;
        }
        match hostname.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        }
    } else {
        !pattern.contains('*') && pattern.eq_ignore_ascii_case(hostname)
    }
}

/// Mutable certificate that has not been signed yet
///
/// Every setter reports success or failure explicitly; nothing is silently
/// ignored. Without explicit issuer fields the certificate is self-issued.
#[derive(Debug, Default)]
pub struct CertificateBuilder {
    subject: Vec<(NameField, String)>,
    issuer: Vec<(NameField, String)>,
    serial: Option<BigNum>,
    validity: Option<Validity>,
    dns_names: Vec<String>,
}

impl CertificateBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) a subject field
    pub fn set_subject_field(&mut self, field: NameField, value: &str) -> Result<(), TlsError> {
        validate_field(field, value)?;
        set_field(&mut self.subject, field, value);
        Ok(())
    }

    /// Set (or replace) an issuer field
    pub fn set_issuer_field(&mut self, field: NameField, value: &str) -> Result<(), TlsError> {
        validate_field(field, value)?;
        set_field(&mut self.issuer, field, value);
        Ok(())
    }

    /// Subject fields set so far
    pub fn subject(&self) -> DistinguishedName {
        DistinguishedName::from_fields(&self.subject)
    }

    /// Issuer fields; the subject for a self-issued certificate
    pub fn issuer(&self) -> DistinguishedName {
        if self.issuer.is_empty() {
            self.subject()
        } else {
            DistinguishedName::from_fields(&self.issuer)
        }
    }

    /// Set the serial number from a hex string
    pub fn set_serial_number(&mut self, hex: &str) -> Result<(), TlsError> {
        let bn = BigNum::from_hex_str(hex)
            .map_err(|e| TlsError::Certificate(format!("Invalid serial number {:?}: {}", hex, e)))?;
        if bn.is_negative() {
            return Err(TlsError::Certificate(format!(
                "Serial number must not be negative: {}",
                hex
            )));
        }
        self.serial = Some(bn);
        Ok(())
    }

    /// Serial number as upper-case hex
    pub fn serial_number(&self) -> Option<String> {
        let hex = self.serial.as_ref()?.to_hex_str().ok()?;
        Some(hex.to_string())
    }

    /// Set the validity window (seconds since the Unix epoch)
    pub fn set_validity(&mut self, not_before: i64, not_after: i64) -> Result<(), TlsError> {
        if not_after <= not_before {
            return Err(TlsError::Certificate(format!(
                "Validity window is empty: not_before {} >= not_after {}",
                not_before, not_after
            )));
        }
        self.validity = Some(Validity {
            not_before,
            not_after,
        });
        Ok(())
    }

    /// Validity window, if set
    pub fn validity(&self) -> Option<Validity> {
        self.validity
    }

    /// Add a DNS subject alternative name
    pub fn add_subject_alt_name(&mut self, dns_name: &str) -> Result<(), TlsError> {
        let valid = !dns_name.is_empty()
            && dns_name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'*'));
        if !valid {
            return Err(TlsError::Certificate(format!(
                "Invalid DNS name: {:?}",
                dns_name
            )));
        }
        self.dns_names.push(dns_name.to_string());
        Ok(())
    }

    /// Sign with `key`, which also provides the certificate's public key
    pub fn sign<T: HasPrivate + HasPublic>(&self, key: &PKeyRef<T>) -> Result<Certificate, TlsError> {
        if self.subject.is_empty() {
            return Err(TlsError::Certificate(
                "Cannot sign a certificate without subject fields".to_string(),
            ));
        }

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;

        let serial = match &self.serial {
            Some(bn) => bn.to_asn1_integer()?,
            None => BigNum::from_u32(1)?.to_asn1_integer()?,
        };
        builder.set_serial_number(&serial)?;

        let subject = build_name(&self.subject)?;
        builder.set_subject_name(&subject)?;
        if self.issuer.is_empty() {
            builder.set_issuer_name(&subject)?;
        } else {
            let issuer = build_name(&self.issuer)?;
            builder.set_issuer_name(&issuer)?;
        }

        let validity = match self.validity {
            Some(validity) => validity,
            None => {
                let now = unix_now();
                Validity {
                    not_before: now,
                    not_after: now + DEFAULT_VALIDITY_SECS,
                }
            }
        };
        let not_before = Asn1Time::from_unix(validity.not_before as libc::time_t)?;
        let not_after = Asn1Time::from_unix(validity.not_after as libc::time_t)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(key)?;

        if !self.dns_names.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for name in &self.dns_names {
                san.dns(name);
            }
            let extension = san.build(&builder.x509v3_context(None, None))?;
            builder.append_extension(extension)?;
        }

        builder.sign(key, MessageDigest::sha256())?;
        Ok(Certificate::from_x509(builder.build()))
    }
}

fn validate_field(field: NameField, value: &str) -> Result<(), TlsError> {
    if value.is_empty() {
        return Err(TlsError::Certificate(format!("Empty value for {:?}", field)));
    }
    // Let OpenSSL apply its per-field string constraints (e.g. country = 2 chars).
    let mut probe = X509NameBuilder::new()?;
    probe
        .append_entry_by_nid(field.nid(), value)
        .map_err(|e| TlsError::Certificate(format!("Invalid value for {:?}: {:?} ({})", field, value, e)))
}

fn set_field(fields: &mut Vec<(NameField, String)>, field: NameField, value: &str) {
    match fields.iter_mut().find(|(f, _)| *f == field) {
        Some(entry) => entry.1 = value.to_string(),
        None => fields.push((field, value.to_string())),
    }
}

fn build_name(fields: &[(NameField, String)]) -> Result<X509Name, TlsError> {
    let mut name = X509NameBuilder::new()?;
    // Emit in a stable order regardless of insertion order.
    for field in NameField::ALL {
        if let Some((_, value)) = fields.iter().find(|(f, _)| *f == field) {
            name.append_entry_by_nid(field.nid(), value)?;
        }
    }
    Ok(name.build())
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Generate a throwaway P-256 key for tests
#[cfg(test)]
pub(crate) fn test_key() -> openssl::pkey::PKey<openssl::pkey::Private> {
    use openssl::ec::{EcGroup, EcKey};
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    openssl::pkey::PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

/// Issue a self-signed certificate for `host` with a throwaway key
#[cfg(test)]
pub(crate) fn test_identity(
    host: &str,
) -> (Certificate, openssl::pkey::PKey<openssl::pkey::Private>) {
    let key = test_key();
    let mut builder = CertificateBuilder::new();
    builder.set_subject_field(NameField::CommonName, host).unwrap();
    builder.add_subject_alt_name(host).unwrap();
    let cert = builder.sign(&key).unwrap();
    (cert, key)
}
