//! Error types for pop3-client

use thiserror::Error;

/// All the ways a mailbox operation can fail.
///
/// The variants mirror how callers are expected to react:
/// [`Error::Transport`] means the connection is gone and a reconnect may
/// help, [`Error::Protocol`] carries the server's own `-ERR` text,
/// [`Error::Integrity`] is a local cache/tempfile failure that leaves the
/// connection usable, and [`Error::Trust`] / [`Error::Aborted`] /
/// [`Error::Stale`] must never be retried silently.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket-level failure or unexpected close. The connection has been
    /// torn down; the operation may be retried after a reconnect.
    #[error("connection error: {0}")]
    Transport(String),

    /// The server answered `-ERR`. The message is the server's error line.
    #[error("server error: {0}")]
    Protocol(String),

    /// Writing to a tempfile or cache failed. The connection stays up.
    #[error("cache error: {0}")]
    Integrity(String),

    /// TLS handshake failure, hostname mismatch, or certificate rejected
    /// by the user. The connection is aborted and never retried.
    #[error("certificate verification failed: {0}")]
    Trust(String),

    /// The user interrupted a blocking operation. Never retried silently.
    #[error("operation aborted")]
    Aborted,

    /// A message was addressed through a refno that is no longer valid
    /// for this connection.
    #[error("the message index is incorrect; try reopening the mailbox")]
    Stale,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the failing operation may be re-attempted after a
    /// reconnect. Only transport-level failures qualify; protocol,
    /// trust, and user-initiated failures must surface.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
