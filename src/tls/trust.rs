//! Session trust sequence and the on-disk certificate file
//!
//! Two tiers of remembered trust back the interactive verifier:
//!
//! - the **session trust sequence**: certificates the user accepted (or
//!   that matched the certificate file) since process start. Append-only
//!   and never evicted, so re-connecting to the same server within one
//!   process never re-prompts.
//! - the **certificate file**: a user-maintained concatenation of PEM
//!   blocks. "(a)ccept always" appends here; loads silently filter out
//!   entries outside their validity window, because expired anchors make
//!   chain verification misbehave.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls::pki_types::CertificateDer;
use tracing::debug;

use crate::error::Result;
use crate::tls::cert::{same_certificate, within_validity, CertId};

/// Process-lifetime sequence of accepted certificates.
#[derive(Default)]
pub struct SessionTrust {
    certs: Mutex<Vec<CertId>>,
}

impl SessionTrust {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn contains(&self, id: &CertId) -> bool {
        self.certs
            .lock()
            .unwrap()
            .iter()
            .any(|stored| same_certificate(stored, id))
    }

    pub(crate) fn insert(&self, id: CertId) {
        debug!("caching trusted certificate for this session");
        self.certs.lock().unwrap().push(id);
    }

    pub fn len(&self) -> usize {
        self.certs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read every certificate from a PEM bundle. Entries that fail to parse
/// are skipped; an absent file is an empty bundle.
fn read_bundle(path: &Path) -> Vec<CertificateDer<'static>> {
    let Ok(data) = fs::read(path) else {
        return Vec::new();
    };
    rustls_pemfile::certs(&mut data.as_slice())
        .filter_map(|c| c.ok())
        .collect()
}

/// Load the certificate file for use as verification anchors, silently
/// filtering out entries outside their validity window.
pub(crate) fn load_anchors(path: &Path) -> Vec<CertificateDer<'static>> {
    read_bundle(path)
        .into_iter()
        .filter(|der| {
            let ok = within_validity(der);
            if !ok {
                debug!("filtering expired certificate from {}", path.display());
            }
            ok
        })
        .collect()
}

/// Does the file contain a byte-equal copy of `presented`, currently
/// within its validity window? `verify_dates = false` waives the
/// validity requirement.
pub(crate) fn file_contains(path: &Path, presented: &CertificateDer<'_>, verify_dates: bool) -> bool {
    let id = CertId::of(presented);
    read_bundle(path).iter().any(|stored| {
        same_certificate(&CertId::of(stored), &id) && (!verify_dates || within_validity(stored))
    })
}

/// Append one certificate to the file as a PEM block. The file is
/// created when missing; existing content is never rewritten.
pub(crate) fn append_to_file(path: &Path, der: &CertificateDer<'_>) -> Result<()> {
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    let encoded = BASE64.encode(der.as_ref());
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).expect("base64 output is ascii"));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");

    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(pem.as_bytes())?;
    Ok(())
}
