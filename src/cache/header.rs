//! Header cache: serialized envelopes keyed by UIDL
//!
//! A cache hit saves one `TOP` round trip per message on every
//! reconnect, which is what makes reopening a large POP mailbox
//! bearable. Only the envelope and content geometry are persisted;
//! flags, refno, and index are connection-scoped and re-derived on
//! restore.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{decode_id, encode_id};
use crate::envelope::Envelope;
use crate::error::{Error, Result};

/// The persistent part of a header record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedHeader {
    pub envelope: Envelope,
    /// Body length in octets as reported by the server.
    pub content_length: u64,
    /// Byte offset of the body within the message.
    pub content_offset: u64,
}

/// Key/value store for [`CachedHeader`]s.
pub trait HeaderCache: Send {
    /// Look up a UIDL; misses and undecodable entries are both `None`.
    fn fetch(&self, uidl: &str) -> Option<CachedHeader>;
    fn store(&self, uidl: &str, header: &CachedHeader) -> Result<()>;
    /// Deleting an absent key is not an error.
    fn delete(&self, uidl: &str) -> Result<()>;
    /// Visit every stored UIDL, for the orphan sweep. The first
    /// visitor error stops the iteration and propagates.
    fn list(&self, visit: &mut dyn FnMut(&str) -> Result<()>) -> Result<()>;
}

/// Filesystem header cache: one JSON file per UIDL under
/// `<account dir>/hcache/`.
pub struct FsHeaderCache {
    dir: PathBuf,
}

impl FsHeaderCache {
    pub fn open(account_dir: &Path) -> Result<Self> {
        let dir = account_dir.join("hcache");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, uidl: &str) -> PathBuf {
        self.dir.join(encode_id(uidl))
    }
}

impl HeaderCache for FsHeaderCache {
    fn fetch(&self, uidl: &str) -> Option<CachedHeader> {
        let data = fs::read(self.path_for(uidl)).ok()?;
        match serde_json::from_slice(&data) {
            Ok(header) => Some(header),
            Err(e) => {
                // A corrupt entry is just a miss; it gets rewritten
                // after the next TOP.
                debug!("discarding unreadable header cache entry {uidl}: {e}");
                None
            }
        }
    }

    fn store(&self, uidl: &str, header: &CachedHeader) -> Result<()> {
        let data = serde_json::to_vec(header)
            .map_err(|e| Error::Integrity(format!("cannot serialize header {uidl}: {e}")))?;
        fs::write(self.path_for(uidl), data)
            .map_err(|e| Error::Integrity(format!("cannot write header cache: {e}")))
    }

    fn delete(&self, uidl: &str) -> Result<()> {
        match fs::remove_file(self.path_for(uidl)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Integrity(format!("cannot delete header cache: {e}"))),
        }
    }

    fn list(&self, visit: &mut dyn FnMut(&str) -> Result<()>) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(uidl) = decode_id(name) else {
                continue;
            };
            visit(&uidl)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CachedHeader {
        CachedHeader {
            envelope: Envelope::parse(
                b"From: a@example.com\r\nSubject: hi\r\nDate: Mon, 01 Jan 2024 12:00:00 +0000\r\n\r\n",
            ),
            content_length: 345,
            content_offset: 78,
        }
    }

    #[test]
    fn store_fetch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsHeaderCache::open(dir.path()).unwrap();
        let header = sample();

        cache.store("AAA", &header).unwrap();
        assert_eq!(cache.fetch("AAA"), Some(header));
        assert_eq!(cache.fetch("BBB"), None);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsHeaderCache::open(dir.path()).unwrap();

        cache.store("AAA", &sample()).unwrap();
        cache.delete("AAA").unwrap();
        assert_eq!(cache.fetch("AAA"), None);
        cache.delete("AAA").unwrap();
    }

    #[test]
    fn corrupt_entries_read_as_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsHeaderCache::open(dir.path()).unwrap();

        fs::write(dir.path().join("hcache").join("AAA"), b"not json").unwrap();
        assert_eq!(cache.fetch("AAA"), None);
    }

    #[test]
    fn list_visits_every_stored_uidl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsHeaderCache::open(dir.path()).unwrap();

        cache.store("AAA", &sample()).unwrap();
        cache.store("a b", &sample()).unwrap();

        let mut seen = Vec::new();
        cache
            .list(&mut |uidl| {
                seen.push(uidl.to_string());
                Ok(())
            })
            .unwrap();
        seen.sort();
        assert_eq!(seen, ["AAA", "a b"]);

        cache.delete("AAA").unwrap();
        let mut seen = Vec::new();
        cache
            .list(&mut |uidl| {
                seen.push(uidl.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, ["a b"]);
    }

    #[test]
    fn uidls_with_path_characters_are_safe() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsHeaderCache::open(dir.path()).unwrap();

        cache.store("../escape", &sample()).unwrap();
        assert!(cache.fetch("../escape").is_some());
        // Nothing landed outside the cache directory.
        assert!(dir.path().join("hcache").join("..%2Fescape").exists());
    }
}
