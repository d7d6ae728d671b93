//! Interactive certificate confirmation seam
//!
//! The trust engine never talks to a terminal itself. When automated
//! verification cannot decide, it hands the UI a [`CertificateReport`]
//! with everything the classic certificate dialog shows and asks for a
//! [`TrustChoice`]. The UI side of this crate's users implements
//! [`TrustPrompt`]; tests use scripted implementations.

/// What the user decided about one certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustChoice {
    /// Abort the handshake.
    Reject,
    /// Trust this certificate for the rest of the process.
    AcceptOnce,
    /// Trust it and append it to the certificate file.
    AcceptAlways,
    /// Leave this chain entry unverified and move on to the next one.
    Skip,
}

/// Which answers the dialog may offer for this certificate.
///
/// Reject and accept-once are always available. A choice returned even
/// though it was not offered is downgraded by the engine: `AcceptAlways`
/// to `AcceptOnce`, `Skip` to `Reject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptChoices {
    /// Offer "(a)ccept always": requires a certificate file and a
    /// certificate within its validity window.
    pub allow_always: bool,
    /// Offer "(s)kip": requires partial-chain verification and a
    /// non-leaf certificate.
    pub allow_skip: bool,
}

/// One distinguished name, broken into the parts the dialog displays.
/// Parts missing from the certificate are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnParts {
    pub common_name: String,
    pub email: String,
    pub organization: String,
    pub organizational_unit: String,
    pub locality: String,
    pub state: String,
    pub country: String,
}

/// Everything the confirmation dialog presents for one certificate.
#[derive(Debug, Clone)]
pub struct CertificateReport {
    pub subject: DnParts,
    pub issuer: DnParts,
    /// Validity window, human-readable.
    pub not_before: String,
    pub not_after: String,
    pub sha1_fingerprint: String,
    pub md5_fingerprint: String,
    /// 1-based position in the chain as presented to the user
    /// ("certificate N of M"); the root is 1, the leaf is M.
    pub position: usize,
    pub chain_len: usize,
}

/// UI collaborator deciding the fate of an unverified certificate.
///
/// Called synchronously from inside the TLS handshake; the handshake
/// stalls until it returns, which is exactly the behaviour an
/// interactive mail client wants.
pub trait TrustPrompt: Send + Sync {
    fn confirm(&self, report: &CertificateReport, choices: PromptChoices) -> TrustChoice;
}

/// A prompt that rejects everything. The right default for
/// non-interactive use: nothing gets trusted without a user.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAll;

impl TrustPrompt for RejectAll {
    fn confirm(&self, _report: &CertificateReport, _choices: PromptChoices) -> TrustChoice {
        TrustChoice::Reject
    }
}
