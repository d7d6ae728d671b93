//! The POP mailbox driver
//!
//! [`PopMailbox`] binds the protocol session, the two caches, and the
//! reconnect policy into the mailbox contract: open, check, sync,
//! fetch-message, close. The driving invariant is that the UIDL is the
//! only persistent message identity; the server's 1-based refno is
//! valid for one connection only and is recomputed from a fresh `UIDL`
//! listing on every reconnect. A record whose UIDL disappears from the
//! listing was deleted on the server and is flagged accordingly.
//!
//! Fetch and sync retry through reconnects until they succeed or hit a
//! non-transport error; a user interrupt always stops the retrying.

use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::cache::{
    account_cache_dir, BodyCache, BodyWriter, CachedHeader, FsBodyCache, FsHeaderCache, HeaderCache,
};
use crate::config::{AccountConfig, PopConfig};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use crate::protocol::{Capability, PopSession, SessionStatus};
use crate::tls::TlsEngine;

/// Fallback message slots kept when no body cache is configured.
const POP_CACHE_LEN: usize = 10;

bitflags! {
    /// What the mailbox permits its caller to do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Acl: u8 {
        const SEEN = 1 << 0;
        const DELETE = 1 << 1;
        /// Flag changes survive reopening. Granted only with a header
        /// cache, which is where the flags live.
        const WRITE = 1 << 2;
    }
}

/// One message in the mailbox view.
#[derive(Debug, Clone, Default)]
pub struct HeaderRecord {
    /// Server-assigned unique id; the persistent identity.
    pub uidl: String,
    /// 1-based message number for the current connection; `None` until
    /// this connection's UIDL listing has named it.
    pub refno: Option<u32>,
    /// 0-based position in the mailbox view.
    pub index: usize,
    pub envelope: Envelope,
    /// Body length in octets.
    pub content_length: u64,
    /// Byte offset of the body within the message.
    pub content_offset: u64,
    pub deleted: bool,
    pub changed: bool,
    pub read: bool,
    pub old: bool,
}

/// Outcome of a rate-limited mailbox check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    NoChange,
    /// New messages appeared; the count of them.
    NewMail(usize),
}

/// A bounded ring of temp files standing in for the body cache when
/// none is configured. Slots are addressed by message index; dropping
/// a slot unlinks its file.
struct TempRing {
    slots: Vec<Option<(usize, NamedTempFile)>>,
}

impl TempRing {
    fn new() -> Self {
        Self {
            slots: (0..POP_CACHE_LEN).map(|_| None).collect(),
        }
    }

    fn get(&self, index: usize) -> Option<Vec<u8>> {
        let (stored, file) = self.slots[index % POP_CACHE_LEN].as_ref()?;
        if *stored != index {
            return None;
        }
        fs::read(file.path()).ok()
    }

    fn install(&mut self, index: usize, file: NamedTempFile) {
        self.slots[index % POP_CACHE_LEN] = Some((index, file));
    }

    fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

/// Where a streamed message lands: the body cache, or a ring slot.
enum MessageSink {
    Cache(Box<dyn BodyWriter>),
    Ring(NamedTempFile),
}

impl Write for MessageSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Cache(w) => w.write(buf),
            Self::Ring(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Cache(w) => w.flush(),
            Self::Ring(f) => f.flush(),
        }
    }
}

/// An open POP mailbox.
pub struct PopMailbox {
    account: AccountConfig,
    config: PopConfig,
    tls: Arc<TlsEngine>,
    interrupt: Interrupt,
    session: PopSession,
    records: Vec<HeaderRecord>,
    hcache: Option<Box<dyn HeaderCache>>,
    bcache: Option<Box<dyn BodyCache>>,
    ring: TempRing,
    acl: Acl,
    size: u64,
    check_time: Option<Instant>,
    /// One-shot dirty bit: refno ordering changed (or the mailbox was
    /// synced), so locally ring-cached messages are stale.
    clear_cache: bool,
    /// Set when the server turns out not to support UIDL: without a
    /// persistent identity the caches are unusable and nothing may be
    /// written back.
    read_only: bool,
}

impl PopMailbox {
    /// Open the mailbox: connect, authenticate, and fetch the header
    /// view.
    ///
    /// # Errors
    ///
    /// Connection and authentication failures propagate. Transport
    /// drops during the initial header fetch are retried until the
    /// user interrupts.
    pub async fn open(
        account: AccountConfig,
        config: PopConfig,
        tls: Arc<TlsEngine>,
        interrupt: Interrupt,
    ) -> Result<Self> {
        let (hcache, bcache) = open_caches(&account, &config);

        let session = PopSession::open(&account, &config, &tls, interrupt.clone()).await?;

        let mut acl = Acl::SEEN | Acl::DELETE;
        if hcache.is_some() {
            acl |= Acl::WRITE;
        }

        let mut mailbox = Self {
            size: session.size(),
            session,
            account,
            config,
            tls,
            interrupt,
            records: Vec::new(),
            hcache,
            bcache,
            ring: TempRing::new(),
            acl,
            check_time: None,
            clear_cache: false,
            read_only: false,
        };

        info!("Fetching list of messages...");
        loop {
            mailbox.reconnect().await?;
            match mailbox.fetch_headers().await {
                Ok(_) => return Ok(mailbox),
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn records(&self) -> &[HeaderRecord] {
        &self.records
    }

    pub fn message_count(&self) -> usize {
        self.records.len()
    }

    /// Total mailbox size in octets, from the server's `STAT`.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn acl(&self) -> Acl {
        self.acl
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The last server error line, for display.
    pub fn server_error(&self) -> &str {
        self.session.err_msg()
    }

    /// Mark a message for deletion at the next [`PopMailbox::sync`].
    pub fn set_deleted(&mut self, msgno: usize, deleted: bool) -> Result<()> {
        if !self.acl.contains(Acl::DELETE) {
            return Err(Error::Config("mailbox is read-only".into()));
        }
        self.records[msgno].deleted = deleted;
        Ok(())
    }

    /// Update the read/old flags; persisted through the header cache
    /// at the next sync.
    pub fn set_read(&mut self, msgno: usize, read: bool) -> Result<()> {
        if !self.acl.contains(Acl::SEEN) {
            return Err(Error::Config("mailbox does not track seen state".into()));
        }
        let record = &mut self.records[msgno];
        if record.read != read {
            record.read = read;
            record.old = false;
            record.changed = true;
        }
        Ok(())
    }

    /// Fetch one message body, from cache when possible.
    ///
    /// # Errors
    ///
    /// [`Error::Stale`] when the record has no refno on this
    /// connection (the caller must reopen the mailbox); cache write
    /// failures as [`Error::Integrity`]. Transport drops are retried.
    pub async fn fetch_message(&mut self, msgno: usize) -> Result<Vec<u8>> {
        let uidl = self.records[msgno].uidl.clone();
        let index = self.records[msgno].index;

        if let Some(bcache) = &self.bcache {
            if !self.read_only {
                if let Some(bytes) = bcache.get(&uidl)? {
                    debug!("body cache hit for {uidl}");
                    return Ok(bytes);
                }
            }
        }
        if let Some(bytes) = self.ring.get(index) {
            debug!("local cache hit for message {index}");
            return Ok(bytes);
        }

        loop {
            self.reconnect().await?;

            let Some(refno) = self.records[msgno].refno else {
                return Err(Error::Stale);
            };

            let mut sink = self.open_sink(&uidl)?;
            info!("Fetching message {refno}...");
            let streamed = self
                .session
                .retr(refno, |line| {
                    sink.write_all(line.as_bytes())
                        .and_then(|()| sink.write_all(b"\n"))
                        .map_err(|e| {
                            Error::Integrity(format!(
                                "cannot write message to temporary file: {e}"
                            ))
                        })
                })
                .await;

            match streamed {
                Ok(()) => {
                    let bytes = match sink {
                        MessageSink::Cache(writer) => {
                            writer.commit()?;
                            let bcache = self.bcache.as_ref().expect("sink implies body cache");
                            bcache.get(&uidl)?.ok_or_else(|| {
                                Error::Integrity("committed body vanished from cache".into())
                            })?
                        }
                        MessageSink::Ring(file) => {
                            let bytes = fs::read(file.path())?;
                            self.ring.install(index, file);
                            bytes
                        }
                    };

                    // The header view was built from TOP output; now
                    // that the whole message is here, refresh the
                    // envelope and the content geometry from it.
                    let record = &mut self.records[msgno];
                    record.envelope = Envelope::parse(&bytes);
                    record.content_offset = Envelope::body_offset(&bytes) as u64;
                    record.content_length =
                        (bytes.len() as u64).saturating_sub(record.content_offset);

                    return Ok(bytes);
                }
                // The sink is dropped here, discarding the partial
                // message, before the retry re-stages it.
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply deletions and flag changes to the server, then QUIT. The
    /// server commits deletions only on a successful QUIT, which is
    /// what makes the retry-after-reconnect loop idempotent.
    pub async fn sync(&mut self) -> Result<()> {
        self.check_time = None;

        loop {
            self.reconnect().await?;
            match self.sync_once().await {
                Ok(()) => {
                    self.clear_cache = true;
                    self.clear_local_cache();
                    return Ok(());
                }
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn sync_once(&mut self) -> Result<()> {
        for i in 0..self.records.len() {
            let record = &self.records[i];
            let uidl = record.uidl.clone();

            if record.deleted {
                if let Some(refno) = record.refno {
                    debug!("deleting message {refno} ({uidl})");
                    self.session.dele(refno).await?;
                    if let Some(bcache) = &self.bcache {
                        let _ = bcache.del(&uidl);
                    }
                    if let Some(hcache) = &self.hcache {
                        let _ = hcache.delete(&uidl);
                    }
                }
            }

            if self.records[i].changed {
                if let Some(hcache) = &self.hcache {
                    hcache.store(&uidl, &cached_from(&self.records[i]))?;
                }
                self.records[i].changed = false;
            }
        }

        self.session.quit().await
    }

    /// Rate-limited check for new mail: reconnects and re-fetches the
    /// header view when the check interval has passed.
    pub async fn check(&mut self) -> Result<CheckStatus> {
        if let Some(last) = self.check_time {
            if last.elapsed() < self.config.check_interval {
                return Ok(CheckStatus::NoChange);
            }
        }

        self.logout().await;
        self.session =
            PopSession::open(&self.account, &self.config, &self.tls, self.interrupt.clone())
                .await?;
        self.size = self.session.size();

        info!("Checking for new messages...");
        let fetched = self.fetch_headers().await;
        self.clear_local_cache();

        match fetched {
            Ok(0) => Ok(CheckStatus::NoChange),
            Ok(n) => Ok(CheckStatus::NewMail(n)),
            Err(e) => Err(e),
        }
    }

    /// Close the mailbox: best-effort QUIT and local cleanup. The
    /// on-disk caches stay for the next open.
    pub async fn close(&mut self) {
        self.logout().await;
        self.clear_cache = true;
        self.clear_local_cache();
    }

    async fn logout(&mut self) {
        if self.session.status() == SessionStatus::Authenticated {
            let _ = self.session.quit().await;
        } else {
            self.session.release().await;
        }
    }

    /// Ensure a usable connection, re-enumerating UIDLs so every
    /// record's refno is valid for the new connection.
    async fn reconnect(&mut self) -> Result<()> {
        if self.session.is_connected() {
            return Ok(());
        }

        self.session =
            PopSession::open(&self.account, &self.config, &self.tls, self.interrupt.clone())
                .await?;
        self.size = self.session.size();

        self.refresh_refnos().await?;
        self.clear_local_cache();
        Ok(())
    }

    /// Refno recovery after a reconnect: re-map every known UIDL to
    /// its number on the new connection. New messages are picked up by
    /// the next full header fetch, not here.
    async fn refresh_refnos(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        debug!("verifying message indexes");

        for record in &mut self.records {
            record.refno = None;
        }

        let records = &mut self.records;
        let clear_cache = &mut self.clear_cache;
        self.session
            .uidl(|refno, uidl| {
                if let Some(record) = records.iter_mut().find(|r| r.uidl == uidl) {
                    let new_index = (refno - 1) as usize;
                    if record.index != new_index {
                        *clear_cache = true;
                    }
                    record.refno = Some(refno);
                    record.index = new_index;
                }
                Ok(())
            })
            .await
    }

    /// Build (or rebuild) the header view from a `UIDL` listing,
    /// loading envelopes from the header cache or `TOP`.
    ///
    /// Returns the number of messages new to the view.
    async fn fetch_headers(&mut self) -> Result<usize> {
        self.check_time = Some(Instant::now());
        self.clear_cache = false;

        if self.session.uidl_capability() == Capability::Absent {
            return self.fetch_headers_without_uidl().await;
        }

        for record in &mut self.records {
            record.refno = None;
        }
        let old_count = self.records.len();

        let records = &mut self.records;
        let clear_cache = &mut self.clear_cache;
        let listed = self
            .session
            .uidl(|refno, uidl| {
                let new_index = (refno - 1) as usize;
                match records.iter_mut().find(|r| r.uidl == uidl) {
                    Some(record) => {
                        if record.index != new_index {
                            *clear_cache = true;
                        }
                        record.refno = Some(refno);
                        record.index = new_index;
                    }
                    None => {
                        debug!("new header {refno} {uidl}");
                        records.push(HeaderRecord {
                            uidl: uidl.to_string(),
                            refno: Some(refno),
                            index: new_index,
                            ..HeaderRecord::default()
                        });
                    }
                }
                Ok(())
            })
            .await;

        if let Err(e) = listed {
            if matches!(e, Error::Protocol(_))
                && self.session.uidl_capability() == Capability::Absent
            {
                // No stable identity: degrade to a read-only view.
                warn!("{}", self.session.err_msg());
                return self.fetch_headers_without_uidl().await;
            }
            return Err(e);
        }

        let mut lost = 0;
        for record in &mut self.records[..old_count] {
            if record.refno.is_none() {
                record.deleted = true;
                lost += 1;
            }
        }
        if lost > 0 {
            warn!("{lost} messages have been lost. Try reopening the mailbox.");
        }

        let mut processed = old_count;
        let mut failure = None;
        while processed < self.records.len() {
            let uidl = self.records[processed].uidl.clone();

            let mut hcached = false;
            if let Some(hcache) = &self.hcache {
                if let Some(cached) = hcache.fetch(&uidl) {
                    debug!("header cache hit for {uidl}");
                    // Restore the envelope but keep the refno, index,
                    // and UIDL assigned for this connection.
                    let record = &mut self.records[processed];
                    record.envelope = cached.envelope;
                    record.content_length = cached.content_length;
                    record.content_offset = cached.content_offset;
                    hcached = true;
                }
            }

            if !hcached {
                if let Err(e) = self.read_header(processed).await {
                    failure = Some(e);
                    break;
                }
                if let Some(hcache) = &self.hcache {
                    let _ = hcache.store(&uidl, &cached_from(&self.records[processed]));
                }
            }

            let bcached = self
                .bcache
                .as_ref()
                .map(|b| b.exists(&uidl))
                .unwrap_or(false);
            let record = &mut self.records[processed];
            record.read = false;
            record.old = false;
            if bcached {
                record.read = true;
            } else if hcached && self.config.mark_old {
                record.old = true;
            }

            processed += 1;
        }

        if let Some(e) = failure {
            // Keep what was fully processed; the unprocessed tail is
            // re-discovered by the next listing.
            self.records.truncate(processed);
            return Err(e);
        }

        if self.config.message_cache_clean {
            self.sweep_orphans()?;
        }

        Ok(self.records.len() - old_count)
    }

    /// Header view without UIDL: identities are this connection's
    /// message numbers, so nothing may be cached or written back.
    async fn fetch_headers_without_uidl(&mut self) -> Result<usize> {
        self.read_only = true;
        self.acl = Acl::SEEN;
        self.records.clear();

        for refno in 1..=self.session.message_count() {
            self.records.push(HeaderRecord {
                uidl: refno.to_string(),
                refno: Some(refno),
                index: (refno - 1) as usize,
                ..HeaderRecord::default()
            });
        }

        for i in 0..self.records.len() {
            self.read_header(i).await?;
        }

        Ok(self.records.len())
    }

    /// Fill in one record's envelope and content geometry from the
    /// server, via `TOP` or, when the server lacks it, a full `RETR`.
    async fn read_header(&mut self, msgno: usize) -> Result<()> {
        let refno = self.records[msgno]
            .refno
            .expect("new records carry a refno");
        let size = self.session.list(refno).await?;

        let mut raw = Vec::new();

        let mut use_retr = self.session.top_capability() == Capability::Absent;
        if !use_retr {
            let streamed = self
                .session
                .top(refno, |line| {
                    raw.extend_from_slice(line.as_bytes());
                    raw.push(b'\n');
                    Ok(())
                })
                .await;
            match streamed {
                Ok(()) => {}
                Err(Error::Protocol(_))
                    if self.session.top_capability() == Capability::Absent =>
                {
                    warn!("{}", self.session.err_msg());
                    raw.clear();
                    use_retr = true;
                }
                Err(e) => return Err(e),
            }
        }
        if use_retr {
            // Degraded path: pull the whole message just to see its
            // headers.
            self.session
                .retr(refno, |line| {
                    raw.extend_from_slice(line.as_bytes());
                    raw.push(b'\n');
                    Ok(())
                })
                .await?;
        }

        let record = &mut self.records[msgno];
        record.envelope = Envelope::parse(&raw);
        record.content_offset = Envelope::body_offset(&raw) as u64;
        record.content_length = size.saturating_sub(record.content_offset);
        Ok(())
    }

    /// Evict cache entries whose UIDL left the mailbox. Both caches
    /// are swept: an identity absent from the current listing has no
    /// way back, so its stored body and header are both dead weight.
    fn sweep_orphans(&self) -> Result<()> {
        let records = &self.records;

        if let Some(bcache) = &self.bcache {
            bcache.list(&mut |uidl| {
                if records.iter().any(|r| r.uidl == uidl) {
                    return Ok(());
                }
                debug!("evicting orphaned body cache entry {uidl}");
                bcache.del(uidl)
            })?;
        }

        if let Some(hcache) = &self.hcache {
            hcache.list(&mut |uidl| {
                if records.iter().any(|r| r.uidl == uidl) {
                    return Ok(());
                }
                debug!("evicting orphaned header cache entry {uidl}");
                hcache.delete(uidl)
            })?;
        }

        Ok(())
    }

    fn open_sink(&mut self, uidl: &str) -> Result<MessageSink> {
        if !self.read_only {
            if let Some(bcache) = &self.bcache {
                match bcache.put(uidl) {
                    Ok(writer) => return Ok(MessageSink::Cache(writer)),
                    Err(e) => debug!("body cache rejected writer, using temp file: {e}"),
                }
            }
        }
        let file = NamedTempFile::new()
            .map_err(|e| Error::Integrity(format!("cannot create temporary file: {e}")))?;
        Ok(MessageSink::Ring(file))
    }

    /// Throw away the ring-cached messages once the dirty bit says
    /// their indexes no longer line up.
    fn clear_local_cache(&mut self) {
        if !self.clear_cache {
            return;
        }
        debug!("deleting locally cached messages");
        self.ring.clear();
    }
}

fn cached_from(record: &HeaderRecord) -> CachedHeader {
    CachedHeader {
        envelope: record.envelope.clone(),
        content_length: record.content_length,
        content_offset: record.content_offset,
    }
}

fn open_caches(
    account: &AccountConfig,
    config: &PopConfig,
) -> (Option<Box<dyn HeaderCache>>, Option<Box<dyn BodyCache>>) {
    let Some(root) = &config.cache_dir else {
        return (None, None);
    };
    let dir = account_cache_dir(root, account);

    let hcache = match FsHeaderCache::open(&dir) {
        Ok(cache) => Some(Box::new(cache) as Box<dyn HeaderCache>),
        Err(e) => {
            warn!("header cache unavailable: {e}");
            None
        }
    };
    let bcache = match FsBodyCache::open(&dir) {
        Ok(cache) => Some(Box::new(cache) as Box<dyn BodyCache>),
        Err(e) => {
            warn!("body cache unavailable: {e}");
            None
        }
    };
    (hcache, bcache)
}
