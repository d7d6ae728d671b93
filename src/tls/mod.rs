//! TLS negotiation and the interactive trust engine
//!
//! [`TlsEngine`] is created once per process and shared by every
//! mailbox: it owns the TLS policy, the [`TrustPrompt`] collaborator,
//! and the process-wide [`SessionTrust`] sequence, so a certificate
//! accepted on one connection is honoured on every later one.
//!
//! [`TlsEngine::negotiate`] serves both connection styles: a `pops://`
//! connect upgrades the transport before the first protocol byte, and
//! `STLS` upgrades it mid-conversation. Either way the transport's
//! stream is swapped for the TLS record layer and the caller keeps
//! using the same line-level API.

mod cert;
mod prompt;
mod trust;
mod verify;

pub use prompt::{CertificateReport, DnParts, PromptChoices, RejectAll, TrustChoice, TrustPrompt};
pub use trust::SessionTrust;

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::TlsConfig;
use crate::error::{Error, Result};
use crate::transport::Transport;
use verify::InteractiveVerifier;

/// Process-scoped TLS state: policy, prompt, and session trust.
pub struct TlsEngine {
    config: TlsConfig,
    session: Arc<SessionTrust>,
    prompt: Arc<dyn TrustPrompt>,
}

impl TlsEngine {
    pub fn new(config: TlsConfig, prompt: Arc<dyn TrustPrompt>) -> Self {
        // Ensure the ring crypto provider is installed process-wide.
        // Several engines (or a test harness) may race to install it;
        // the error just means somebody else won.
        let _ = rustls::crypto::ring::default_provider().install_default();

        Self {
            config,
            session: Arc::new(SessionTrust::new()),
            prompt,
        }
    }

    /// The session trust sequence, shared across all connections made
    /// through this engine.
    pub fn session_trust(&self) -> &Arc<SessionTrust> {
        &self.session
    }

    /// Negotiate TLS on an established transport and return the
    /// TLS-wrapped transport. Certificate verification, including any
    /// interactive confirmation, happens inside the handshake.
    ///
    /// # Errors
    ///
    /// [`Error::Trust`] when the handshake fails or the user rejects a
    /// certificate; [`Error::Config`] for unusable TLS settings.
    pub async fn negotiate(&self, transport: Transport, host: &str) -> Result<Transport> {
        let connector = self.connector(host)?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Trust(format!("invalid server name {host}: {e}")))?;

        transport.upgrade_tls(&connector, server_name).await
    }

    /// Build the connector for one connection to `host`. The verifier
    /// is per-connection: it records the expected hostname and carries
    /// the handshake-scoped skip state.
    fn connector(&self, host: &str) -> Result<TlsConnector> {
        let provider = Arc::new(self.provider()?);

        let versions = self.versions()?;
        let verifier = InteractiveVerifier::new(
            host.to_string(),
            self.config.clone(),
            Arc::clone(&self.session),
            Arc::clone(&self.prompt),
            Arc::clone(&provider),
        );

        let builder = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(versions)
            .map_err(|e| Error::Config(format!("unusable TLS protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier));

        let config = match &self.config.client_cert {
            Some(path) => {
                debug!("using client certificate {}", path.display());
                let (chain, key) = load_client_cert(path)?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| Error::Config(format!("bad client certificate: {e}")))?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(TlsConnector::from(Arc::new(config)))
    }

    fn versions(&self) -> Result<&'static [&'static rustls::SupportedProtocolVersion]> {
        match (self.config.tlsv12, self.config.tlsv13) {
            (true, true) => Ok(rustls::ALL_VERSIONS),
            (true, false) => {
                const V: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS12];
                Ok(V)
            }
            (false, true) => {
                const V: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];
                Ok(V)
            }
            (false, false) => Err(Error::Config("all TLS versions disabled".into())),
        }
    }

    /// The ring provider, with the cipher list narrowed when the
    /// configuration names specific suites.
    fn provider(&self) -> Result<CryptoProvider> {
        let mut provider = rustls::crypto::ring::default_provider();
        if !self.config.ciphers.is_empty() {
            provider.cipher_suites.retain(|suite| {
                let name = format!("{:?}", suite.suite());
                self.config.ciphers.iter().any(|wanted| *wanted == name)
            });
            if provider.cipher_suites.is_empty() {
                return Err(Error::Config(
                    "no usable cipher suites after applying the cipher list".into(),
                ));
            }
        }
        Ok(provider)
    }
}

fn load_client_cert(
    path: &std::path::Path,
) -> Result<(
    Vec<rustls::pki_types::CertificateDer<'static>>,
    rustls::pki_types::PrivateKeyDer<'static>,
)> {
    let data = std::fs::read(path)?;

    let chain: Vec<_> = rustls_pemfile::certs(&mut data.as_slice())
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::Config(format!("cannot read client certificate: {e}")))?;
    let key = rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|e| Error::Config(format!("cannot read client key: {e}")))?
        .ok_or_else(|| Error::Config(format!("no private key in {}", path.display())))?;

    Ok((chain, key))
}
