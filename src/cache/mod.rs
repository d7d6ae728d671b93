//! UIDL-keyed on-disk caches
//!
//! Two caches sit next to each other under one per-account directory:
//! the header cache (serialized envelopes) and the body cache (full
//! message bytes). Both are keyed by the server-assigned UIDL, the only
//! message identity that survives reconnects. The stores are opaque to
//! the rest of the crate: the mailbox driver talks to the
//! [`HeaderCache`] and [`BodyCache`] traits and never interprets the
//! bytes behind them.

mod body;
mod header;

pub use body::{BodyCache, BodyWriter, FsBodyCache};
pub use header::{CachedHeader, FsHeaderCache, HeaderCache};

use std::path::{Path, PathBuf};

use crate::config::AccountConfig;

/// Directory holding both caches for one account, derived from the
/// account coordinates (scheme is irrelevant: same mailbox either way).
pub fn account_cache_dir(root: &Path, account: &AccountConfig) -> PathBuf {
    let leaf = if account.user.is_empty() {
        format!("{}_{}", account.host, account.port)
    } else {
        format!("{}_{}_{}", account.host, account.port, account.user)
    };
    root.join(encode_id(&leaf))
}

/// Encode a UIDL (or any cache key) into a safe file name. UIDLs are
/// server-chosen and may contain anything printable, so everything
/// outside `[A-Za-z0-9._-]` is percent-encoded.
pub(crate) fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Reverse [`encode_id`]. Returns `None` for names this crate did not
/// produce.
pub(crate) fn decode_id(name: &str) -> Option<String> {
    let mut out = Vec::with_capacity(name.len());
    let mut bytes = name.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = bytes.next()?;
            let lo = bytes.next()?;
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            out.push(b);
        }
    }
    String::from_utf8(out).ok()
}
