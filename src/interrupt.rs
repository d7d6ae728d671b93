//! Cooperative interruption of blocking mailbox operations
//!
//! Mail retrieval spends most of its time inside socket reads. An
//! [`Interrupt`] handle is shared between the UI (which raises it, e.g.
//! from a Ctrl-C handler) and every transport operation (which races
//! against it). A raised flag makes the in-flight I/O return
//! [`Error::Aborted`](crate::Error::Aborted); the owning operation then
//! closes the connection and surfaces the error instead of retrying.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A clonable, process-level interrupt flag.
///
/// Cheap to clone; all clones share the same state. The flag is sticky
/// until [`Interrupt::clear`] is called, so an interrupt raised between
/// two reads is still observed by the next one.
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    raised: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake any I/O currently waiting on it.
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Reset the flag. Called once the abort has been delivered.
    pub fn clear(&self) {
        self.inner.raised.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Resolves when the flag is raised. Completes immediately if it
    /// already is, so a `select!` against this never misses a raise
    /// that happened before the await.
    pub async fn raised(&self) {
        if self.is_raised() {
            return;
        }
        loop {
            let notified = self.inner.notify.notified();
            if self.is_raised() {
                return;
            }
            notified.await;
            if self.is_raised() {
                return;
            }
        }
    }
}
