//! X.509 certificate inspection
//!
//! Thin helpers over `x509-parser` for the pieces the trust engine
//! needs: byte-identity, validity, hostname matching, and the
//! human-readable report for the confirmation dialog. rustls hands us
//! DER; nothing here keeps a parsed certificate alive beyond one call.

use md5::Md5;
use rustls::pki_types::CertificateDer;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use x509_parser::oid_registry::{
    OID_PKCS9_EMAIL_ADDRESS, OID_X509_COMMON_NAME, OID_X509_COUNTRY_NAME, OID_X509_LOCALITY_NAME,
    OID_X509_ORGANIZATIONAL_UNIT, OID_X509_ORGANIZATION_NAME, OID_X509_STATE_OR_PROVINCE_NAME,
};
use x509_parser::prelude::*;

use crate::tls::prompt::{CertificateReport, DnParts};

/// Identity of an accepted certificate: issuer and subject names plus
/// the SHA-256 of the whole certificate. Two certificates compare equal
/// exactly when they are byte-equal copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CertId {
    subject: Vec<u8>,
    issuer: Vec<u8>,
    sha256: [u8; 32],
}

impl CertId {
    pub fn of(der: &CertificateDer<'_>) -> Self {
        let (subject, issuer) = match parse(der) {
            Ok(cert) => (
                cert.subject().as_raw().to_vec(),
                cert.issuer().as_raw().to_vec(),
            ),
            Err(_) => (Vec::new(), Vec::new()),
        };
        Self {
            subject,
            issuer,
            sha256: sha256(der),
        }
    }
}

pub(crate) fn parse<'a>(der: &'a CertificateDer<'_>) -> Result<X509Certificate<'a>, String> {
    X509Certificate::from_der(der.as_ref())
        .map(|(_, cert)| cert)
        .map_err(|e| format!("malformed certificate: {e}"))
}

pub(crate) fn sha256(der: &CertificateDer<'_>) -> [u8; 32] {
    Sha256::digest(der.as_ref()).into()
}

/// Compare a presented certificate against a stored one. Cheap name
/// comparison first, digest second.
pub(crate) fn same_certificate(stored: &CertId, presented: &CertId) -> bool {
    stored.subject == presented.subject
        && stored.issuer == presented.issuer
        && stored.sha256 == presented.sha256
}

/// Is `now` within the certificate's validity window? Malformed
/// certificates count as outside it.
pub(crate) fn within_validity(der: &CertificateDer<'_>) -> bool {
    parse(der).map(|cert| cert.validity().is_valid()).unwrap_or(false)
}

/// Match a hostname against one certificate name.
///
/// A leading `*.` matches exactly one label: `*.example.com` matches
/// `foo.example.com` but neither `a.b.example.com` nor `example.com`.
/// Comparison is ASCII case-insensitive; internationalised hostnames
/// are expected in their IDNA/ASCII form.
pub(crate) fn hostname_match(hostname: &str, certname: &str) -> bool {
    let (cert_part, host_part) = if let Some(suffix) = certname.strip_prefix("*.") {
        let Some(dot) = hostname.find('.') else {
            return false;
        };
        (suffix, &hostname[dot + 1..])
    } else {
        (certname, hostname)
    };

    !cert_part.is_empty() && !host_part.is_empty() && cert_part.eq_ignore_ascii_case(host_part)
}

/// Check a leaf certificate against the server hostname: every
/// `subjectAltName` dNSName first, then the subject common name.
pub(crate) fn check_host(der: &CertificateDer<'_>, hostname: &str) -> bool {
    let Ok(cert) = parse(der) else {
        return false;
    };

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                if hostname_match(hostname, dns) {
                    return true;
                }
            }
        }
    }

    first_attr(cert.subject(), &OID_X509_COMMON_NAME)
        .map(|cn| hostname_match(hostname, &cn))
        .unwrap_or(false)
}

fn first_attr(name: &X509Name<'_>, oid: &x509_parser::oid_registry::Oid<'_>) -> Option<String> {
    name.iter_by_oid(oid)
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
}

fn dn_parts(name: &X509Name<'_>) -> DnParts {
    DnParts {
        common_name: first_attr(name, &OID_X509_COMMON_NAME).unwrap_or_default(),
        email: first_attr(name, &OID_PKCS9_EMAIL_ADDRESS).unwrap_or_default(),
        organization: first_attr(name, &OID_X509_ORGANIZATION_NAME).unwrap_or_default(),
        organizational_unit: first_attr(name, &OID_X509_ORGANIZATIONAL_UNIT).unwrap_or_default(),
        locality: first_attr(name, &OID_X509_LOCALITY_NAME).unwrap_or_default(),
        state: first_attr(name, &OID_X509_STATE_OR_PROVINCE_NAME).unwrap_or_default(),
        country: first_attr(name, &OID_X509_COUNTRY_NAME).unwrap_or_default(),
    }
}

/// Format a digest the way the dialog shows fingerprints:
/// upper-case hex in two-byte groups.
fn fingerprint(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 3);
    for (i, byte) in digest.iter().enumerate() {
        if i > 0 && i % 2 == 0 {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

/// Build the confirmation-dialog report for the certificate at `depth`
/// within a chain of `chain_len` (depth 0 is the leaf).
pub(crate) fn report(der: &CertificateDer<'_>, depth: usize, chain_len: usize) -> CertificateReport {
    let (subject, issuer, not_before, not_after) = match parse(der) {
        Ok(cert) => (
            dn_parts(cert.subject()),
            dn_parts(cert.issuer()),
            cert.validity().not_before.to_string(),
            cert.validity().not_after.to_string(),
        ),
        Err(_) => (
            DnParts::default(),
            DnParts::default(),
            String::new(),
            String::new(),
        ),
    };

    CertificateReport {
        subject,
        issuer,
        not_before,
        not_after,
        sha1_fingerprint: fingerprint(&Sha1::digest(der.as_ref())),
        md5_fingerprint: fingerprint(&Md5::digest(der.as_ref())),
        position: chain_len - depth,
        chain_len,
    }
}
