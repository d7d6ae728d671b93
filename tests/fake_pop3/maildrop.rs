//! Test data model for the fake POP3 server
//!
//! A `Maildrop` is the server-side mailbox: an ordered list of messages
//! plus switches for the optional commands. It lives behind an
//! `Arc<Mutex<_>>` shared between the server and the test, so a test
//! can reorder or remove messages between connections to simulate
//! server-side changes, and can inspect the command log afterwards.

/// One message in the drop. The UIDL is what identifies it across
/// connections; the refno is just its 1-based position at the start of
/// a session.
#[derive(Debug, Clone)]
pub struct TestMessage {
    pub uidl: String,
    pub raw: Vec<u8>,
}

/// Server-side mailbox state plus behaviour switches.
#[derive(Debug, Clone)]
pub struct Maildrop {
    pub messages: Vec<TestMessage>,
    /// Answer `UIDL` with a listing; off simulates a pre-UIDL server.
    pub uidl_enabled: bool,
    /// Answer `UIDL` with `+OK` but no entries, a misbehaviour some
    /// servers show; clients must treat it as "no UIDL support".
    pub uidl_empty: bool,
    /// Answer `TOP`; off forces clients onto whole-message fetches.
    pub top_enabled: bool,
    /// Value for `LAST`, when the server supports it.
    pub last: Option<u32>,
    /// Every command line the server has received, across all
    /// connections. Tests assert on this to see what the client
    /// actually sent (capability re-probes, cache hits avoiding RETR).
    pub log: Vec<String>,
}

impl Maildrop {
    pub fn commands_matching(&self, prefix: &str) -> usize {
        self.log.iter().filter(|l| l.starts_with(prefix)).count()
    }
}

/// Builder for a `Maildrop`.
pub struct MaildropBuilder {
    drop: Maildrop,
}

impl MaildropBuilder {
    pub fn new() -> Self {
        Self {
            drop: Maildrop {
                messages: Vec::new(),
                uidl_enabled: true,
                uidl_empty: false,
                top_enabled: true,
                last: None,
                log: Vec::new(),
            },
        }
    }

    /// Append a message with the given UIDL and raw RFC 2822 bytes.
    pub fn message(mut self, uidl: &str, raw: &[u8]) -> Self {
        self.drop.messages.push(TestMessage {
            uidl: uidl.to_string(),
            raw: raw.to_vec(),
        });
        self
    }

    pub fn without_uidl(mut self) -> Self {
        self.drop.uidl_enabled = false;
        self
    }

    pub fn with_empty_uidl(mut self) -> Self {
        self.drop.uidl_empty = true;
        self
    }

    pub fn without_top(mut self) -> Self {
        self.drop.top_enabled = false;
        self
    }

    pub fn with_last(mut self, last: u32) -> Self {
        self.drop.last = Some(last);
        self
    }

    pub fn build(self) -> Maildrop {
        self.drop
    }
}
