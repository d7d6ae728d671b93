//! Body cache: full message bytes keyed by UIDL
//!
//! Writers stage into a `tmp-` file and only take their final name on
//! [`BodyWriter::commit`], so a fetch that dies mid-stream never leaves
//! a half message behind to be mistaken for a cached body. `list`
//! drives the orphan sweep: it visits committed entries only.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{decode_id, encode_id};
use crate::error::{Error, Result};

const STAGING_PREFIX: &str = "tmp-";

/// Content-addressed store for message bodies.
pub trait BodyCache: Send {
    /// Read a committed body back.
    fn get(&self, uidl: &str) -> Result<Option<Vec<u8>>>;
    /// Open a staging writer. Nothing is visible until commit.
    fn put(&self, uidl: &str) -> Result<Box<dyn BodyWriter>>;
    fn exists(&self, uidl: &str) -> bool;
    /// Deleting an absent entry is not an error.
    fn del(&self, uidl: &str) -> Result<()>;
    /// Visit every committed UIDL. The first visitor error stops the
    /// iteration and propagates.
    fn list(&self, visit: &mut dyn FnMut(&str) -> Result<()>) -> Result<()>;
}

/// A staged body being written. Dropping without commit discards it.
pub trait BodyWriter: Write + Send {
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Filesystem body cache: one file per UIDL under
/// `<account dir>/bcache/`.
pub struct FsBodyCache {
    dir: PathBuf,
}

impl FsBodyCache {
    pub fn open(account_dir: &Path) -> Result<Self> {
        let dir = account_dir.join("bcache");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, uidl: &str) -> PathBuf {
        self.dir.join(encode_id(uidl))
    }
}

impl BodyCache for FsBodyCache {
    fn get(&self, uidl: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(uidl)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Integrity(format!("cannot read body cache: {e}"))),
        }
    }

    fn put(&self, uidl: &str) -> Result<Box<dyn BodyWriter>> {
        let staging = self.dir.join(format!("{STAGING_PREFIX}{}", encode_id(uidl)));
        let file = File::create(&staging)
            .map_err(|e| Error::Integrity(format!("cannot stage body cache entry: {e}")))?;
        Ok(Box::new(FsBodyWriter {
            file: Some(file),
            staging,
            target: self.path_for(uidl),
        }))
    }

    fn exists(&self, uidl: &str) -> bool {
        self.path_for(uidl).exists()
    }

    fn del(&self, uidl: &str) -> Result<()> {
        match fs::remove_file(self.path_for(uidl)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Integrity(format!("cannot delete body cache: {e}"))),
        }
    }

    fn list(&self, visit: &mut dyn FnMut(&str) -> Result<()>) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(STAGING_PREFIX) {
                continue;
            }
            let Some(uidl) = decode_id(name) else {
                continue;
            };
            visit(&uidl)?;
        }
        Ok(())
    }
}

struct FsBodyWriter {
    file: Option<File>,
    staging: PathBuf,
    target: PathBuf,
}

impl Write for FsBodyWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.as_mut().expect("writer not committed").write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.as_mut().expect("writer not committed").flush()
    }
}

impl BodyWriter for FsBodyWriter {
    fn commit(mut self: Box<Self>) -> Result<()> {
        let file = self.file.take().expect("writer not committed");
        let _ = file.sync_all();
        drop(file);
        fs::rename(&self.staging, &self.target)
            .map_err(|e| Error::Integrity(format!("cannot commit body cache entry: {e}")))
    }
}

impl Drop for FsBodyWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            debug!("discarding staged body cache entry");
            let _ = fs::remove_file(&self.staging);
        }
    }
}
