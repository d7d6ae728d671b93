//! Chain-walking certificate verification
//!
//! rustls delegates the whole trust decision to a
//! [`ServerCertVerifier`]; ours re-creates the classic interactive
//! model on top of it. The chain is walked root-first, and each
//! certificate is accepted through the first rule that applies:
//!
//! 1. a byte-equal copy is in the session trust sequence;
//! 2. (leaf only) the hostname matches — a mismatch goes straight to
//!    the prompt with "accept always" disabled;
//! 3. when pre-verification failed, or an earlier chain entry was
//!    skipped: a byte-equal, currently-valid copy is in the certificate
//!    file — otherwise the user is prompted;
//! 4. otherwise it is accepted outright.
//!
//! "Pre-verification" is one webpki pass over the delivered chain
//! against the system roots plus the (expiry-filtered) certificate
//! file. A hostname mismatch alone does not count as a pre-verification
//! failure; naming is this module's own step 2.
//!
//! Skipping a certificate pushes its unverified state onto the next
//! chain entry: the skip marker stays set until something verifies, so
//! a skipped root forces the intermediate below it through rule 3.

use std::fmt;
use std::sync::{Arc, Mutex};

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use tracing::{debug, warn};

use crate::config::TlsConfig;
use crate::tls::cert;
use crate::tls::prompt::{PromptChoices, TrustChoice, TrustPrompt};
use crate::tls::trust::{self, SessionTrust};

/// Per-handshake verification state. The skip marker replaces the
/// OpenSSL ex_data slot; the last-seen memo suppresses the duplicate
/// callback some stacks produce after a skip.
#[derive(Default)]
struct WalkState {
    skip: bool,
    /// Set once a chain entry has been accepted (session, file, or
    /// prompt). Entries below an accepted one verify against it, the
    /// way a library continues after its callback overrides an error.
    accepted_above: bool,
    last_seen: Option<(usize, [u8; 32])>,
}

/// The interactive verifier for one connection.
pub(crate) struct InteractiveVerifier {
    hostname: String,
    config: TlsConfig,
    session: Arc<SessionTrust>,
    prompt: Arc<dyn TrustPrompt>,
    /// Standard webpki verification used as the pre-verification pass;
    /// `None` when no roots are available at all.
    webpki: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    state: Mutex<WalkState>,
}

impl fmt::Debug for InteractiveVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteractiveVerifier")
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

impl InteractiveVerifier {
    pub fn new(
        hostname: String,
        config: TlsConfig,
        session: Arc<SessionTrust>,
        prompt: Arc<dyn TrustPrompt>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        let webpki = build_webpki(&config, &provider);
        Self {
            hostname,
            config,
            session,
            prompt,
            webpki,
            provider,
            state: Mutex::new(WalkState::default()),
        }
    }

    /// Run the webpki pass over the delivered chain. Name mismatches
    /// are deliberately not failures here.
    fn preverify(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        now: UnixTime,
    ) -> bool {
        let Some(webpki) = &self.webpki else {
            return false;
        };
        match webpki.verify_server_cert(end_entity, intermediates, server_name, &[], now) {
            Ok(_) => true,
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => true,
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForNameContext { .. },
            )) => true,
            Err(e) => {
                debug!("pre-verification failed: {e}");
                false
            }
        }
    }

    /// Decide the fate of the whole chain. `chain` is leaf-first, the
    /// order rustls delivers; the walk runs root-first the way the
    /// verify callback was invoked in the original.
    pub(crate) fn walk_chain(
        &self,
        chain: &[CertificateDer<'_>],
        preverified: bool,
    ) -> Result<(), rustls::Error> {
        let len = chain.len();
        for (depth, der) in chain.iter().enumerate().rev() {
            self.check_one(der, depth, len, preverified)?;
        }
        Ok(())
    }

    /// The per-certificate trust decision, `depth` 0 being the leaf.
    fn check_one(
        &self,
        der: &CertificateDer<'_>,
        depth: usize,
        chain_len: usize,
        preverified: bool,
    ) -> Result<(), rustls::Error> {
        let id = cert::CertId::of(der);
        let digest = cert::sha256(der);
        let mut state = self.state.lock().unwrap();
        let verified = preverified || state.accepted_above;

        debug!(
            depth,
            verified,
            skip = state.skip,
            "checking certificate chain entry"
        );

        // A certificate that was just skipped can come around again as
        // "verified"; showing it would read as the skip not working.
        if self.config.verify_partial_chains {
            if state.skip && verified && state.last_seen == Some((depth, digest)) {
                debug!("ignoring duplicate skipped certificate");
                return Ok(());
            }
            state.last_seen = Some((depth, digest));
        }

        if self.session.contains(&id) {
            debug!("using cached certificate");
            state.skip = false;
            state.accepted_above = true;
            return Ok(());
        }

        if depth == 0 && self.config.verify_host && !cert::check_host(der, &self.hostname) {
            warn!(
                "certificate owner does not match hostname {}",
                self.hostname
            );
            // Accepting always would have no effect on the mismatch, so
            // the choice is not offered.
            return self.ask_user(&mut state, der, depth, chain_len, false);
        }

        if !verified || state.skip {
            if let Some(file) = &self.config.certificate_file {
                if trust::file_contains(file, der, self.config.verify_dates) {
                    debug!("certificate found in {}", file.display());
                    state.skip = false;
                    state.accepted_above = true;
                    return Ok(());
                }
            }
            return self.ask_user(&mut state, der, depth, chain_len, true);
        }

        Ok(())
    }

    fn ask_user(
        &self,
        state: &mut WalkState,
        der: &CertificateDer<'_>,
        depth: usize,
        chain_len: usize,
        allow_always: bool,
    ) -> Result<(), rustls::Error> {
        let valid_now = !self.config.verify_dates || cert::within_validity(der);
        let choices = PromptChoices {
            allow_always: allow_always && self.config.certificate_file.is_some() && valid_now,
            // The leaf cannot be skipped.
            allow_skip: self.config.verify_partial_chains && depth != 0,
        };
        let report = cert::report(der, depth, chain_len);

        let mut choice = self.prompt.confirm(&report, choices);
        if choice == TrustChoice::AcceptAlways && !choices.allow_always {
            choice = TrustChoice::AcceptOnce;
        }
        if choice == TrustChoice::Skip && !choices.allow_skip {
            choice = TrustChoice::Reject;
        }

        match choice {
            TrustChoice::Reject => Err(rustls::Error::General(
                "certificate rejected by user".into(),
            )),
            TrustChoice::AcceptOnce => {
                state.skip = false;
                state.accepted_above = true;
                self.session.insert(cert::CertId::of(der));
                Ok(())
            }
            TrustChoice::AcceptAlways => {
                let file = self
                    .config
                    .certificate_file
                    .as_ref()
                    .expect("allow_always implies a certificate file");
                match trust::append_to_file(file, der) {
                    Ok(()) => debug!("certificate saved to {}", file.display()),
                    Err(e) => warn!("could not save certificate: {e}"),
                }
                state.skip = false;
                state.accepted_above = true;
                self.session.insert(cert::CertId::of(der));
                Ok(())
            }
            TrustChoice::Skip => {
                state.skip = true;
                Ok(())
            }
        }
    }
}

/// Assemble the webpki pre-verifier from the OS trust store (when
/// enabled) and the expiry-filtered certificate file.
fn build_webpki(
    config: &TlsConfig,
    provider: &Arc<CryptoProvider>,
) -> Option<Arc<WebPkiServerVerifier>> {
    let mut roots = rustls::RootCertStore::empty();

    if config.use_system_certs {
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        if !native.errors.is_empty() {
            debug!("errors loading system trust store: {:?}", native.errors);
        }
    }

    if let Some(file) = &config.certificate_file {
        // Adding the user's certificates as anchors gives partial
        // chains a root to land on.
        for cert in trust::load_anchors(file) {
            let _ = roots.add(cert);
        }
    }

    if roots.is_empty() {
        return None;
    }

    WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider))
        .build()
        .map_err(|e| debug!("webpki verifier unavailable: {e}"))
        .ok()
}

impl ServerCertVerifier for InteractiveVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let preverified = self.preverify(end_entity, intermediates, server_name, now);

        let mut chain = Vec::with_capacity(intermediates.len() + 1);
        chain.push(end_entity.clone());
        chain.extend(intermediates.iter().cloned());

        self.walk_chain(&chain, preverified)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
