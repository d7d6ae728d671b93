//! POP3 command/response engine
//!
//! One [`PopSession`] owns the transport for one server connection and
//! speaks RFC 1939: single-line commands, `+OK`/`-ERR` status lines,
//! and multi-line data terminated by a lone `.` with dot-stuffing
//! undone. Capability knowledge (`UIDL`, `TOP`) is learned lazily from
//! the first real use and never forgotten within the session.
//!
//! The session tracks protocol state only; which messages exist and
//! what is cached is the mailbox driver's business.

use md5::{Digest, Md5};
use tracing::{debug, info};

use crate::config::{AccountConfig, PopConfig, TlsMode};
use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use crate::tls::TlsEngine;
use crate::transport::Transport;

/// Lazily-probed server capability.
///
/// `Unknown` until the first use of the command; then `Present` on the
/// first `+OK` or `Absent` on the first `-ERR`, and never changes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capability {
    #[default]
    Unknown,
    Absent,
    Present,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    None,
    Authenticated,
    /// QUIT has been sent but not yet answered.
    ByeSent,
    Disconnected,
}

/// Protocol state for one POP3 connection.
pub struct PopSession {
    transport: Option<Transport>,
    status: SessionStatus,
    uidl: Capability,
    top: Capability,
    /// Message count reported by `STAT`.
    msg_count: u32,
    /// Total mailbox octets reported by `STAT`.
    size: u64,
    /// APOP challenge from the greeting, angle brackets included.
    timestamp: Option<String>,
    /// Last human-readable server error line.
    err_msg: String,
}

impl PopSession {
    /// Connect and authenticate per the account's TLS mode: `pops://`
    /// negotiates TLS before the greeting, `starttls` upgrades via
    /// `STLS` after it.
    ///
    /// # Errors
    ///
    /// Authentication failure surfaces as [`Error::Protocol`] and
    /// releases the socket; TLS failures as [`Error::Trust`].
    pub async fn open(
        account: &AccountConfig,
        config: &PopConfig,
        tls: &TlsEngine,
        interrupt: Interrupt,
    ) -> Result<Self> {
        let mut transport = Transport::connect(
            &account.host,
            account.port,
            config.connect_timeout,
            interrupt,
        )
        .await?;

        if account.tls == TlsMode::Tls {
            transport = tls.negotiate(transport, &account.host).await?;
        }

        let mut session = Self {
            transport: Some(transport),
            status: SessionStatus::None,
            uidl: Capability::Unknown,
            top: Capability::Unknown,
            msg_count: 0,
            size: 0,
            timestamp: None,
            err_msg: String::new(),
        };

        let greeting = session.read_line().await?;
        if !greeting.starts_with("+OK") {
            session.release().await;
            return Err(Error::Protocol(greeting));
        }
        session.timestamp = parse_timestamp(&greeting);

        if account.tls == TlsMode::StartTls {
            session.query("STLS").await?;
            let plain = session.transport.take().expect("transport present");
            match tls.negotiate(plain, &account.host).await {
                Ok(upgraded) => session.transport = Some(upgraded),
                Err(e) => return Err(e),
            }
        }

        if let Err(e) = session.authenticate(account, config).await {
            session.release().await;
            return Err(e);
        }

        let (count, size) = session.stat().await?;
        session.msg_count = count;
        session.size = size;
        session.status = SessionStatus::Authenticated;
        info!("Connected to {}: {count} messages ({size} bytes)", account.host);

        Ok(session)
    }

    async fn authenticate(&mut self, account: &AccountConfig, config: &PopConfig) -> Result<()> {
        let pass = account
            .pass
            .as_deref()
            .ok_or_else(|| Error::Config("no password for this account".into()))?;

        if config.apop {
            if let Some(ts) = self.timestamp.clone() {
                debug!("Authenticating with APOP");
                let digest = apop_digest(&ts, pass);
                match self.query(&format!("APOP {} {digest}", account.user)).await {
                    Ok(_) => return Ok(()),
                    Err(e @ Error::Protocol(_)) => {
                        // The challenge was offered but APOP is not
                        // actually wired up; fall back to USER/PASS.
                        debug!("APOP failed ({e}), trying USER/PASS");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        debug!("Authenticating with USER/PASS");
        self.query(&format!("USER {}", account.user)).await?;
        self.query(&format!("PASS {pass}")).await?;
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Authenticated && self.transport.is_some()
    }

    pub fn uidl_capability(&self) -> Capability {
        self.uidl
    }

    pub fn top_capability(&self) -> Capability {
        self.top
    }

    /// Message count from the opening `STAT`.
    pub fn message_count(&self) -> u32 {
        self.msg_count
    }

    /// Mailbox size in octets from the opening `STAT`.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The last `-ERR` line received, for display to the user.
    pub fn err_msg(&self) -> &str {
        &self.err_msg
    }

    /// Issue a single-line command and consume its status line.
    ///
    /// # Errors
    ///
    /// `-ERR` becomes [`Error::Protocol`] (and is captured into
    /// [`PopSession::err_msg`]); transport failures tear the
    /// connection down first.
    pub async fn query(&mut self, cmd: &str) -> Result<String> {
        self.write_line(cmd).await?;
        let line = self.read_line().await?;
        if let Some(err) = line.strip_prefix("-ERR") {
            self.err_msg = err.trim().to_string();
            return Err(Error::Protocol(self.err_msg.clone()));
        }
        if !line.starts_with("+OK") {
            self.err_msg = line.clone();
            return Err(Error::Protocol(line));
        }
        Ok(line)
    }

    /// Issue a command with a multi-line response, passing each data
    /// line (dot-unstuffed, terminator excluded) to `line_cb`. The
    /// callback gets a mutable line so it can rewrite in place;
    /// callback errors abort the stream and propagate.
    pub async fn fetch_data<F>(&mut self, cmd: &str, line_cb: F) -> Result<()>
    where
        F: FnMut(&mut String) -> Result<()>,
    {
        self.query(cmd).await?;
        self.stream_lines(line_cb).await
    }

    /// Consume data lines up to the lone-`.` terminator, undoing
    /// dot-stuffing.
    async fn stream_lines<F>(&mut self, mut line_cb: F) -> Result<()>
    where
        F: FnMut(&mut String) -> Result<()>,
    {
        loop {
            let mut line = self.read_line().await?;
            if line == "." {
                return Ok(());
            }
            if line.starts_with('.') {
                line.remove(0);
            }
            line_cb(&mut line)?;
        }
    }

    /// `STAT` → (message count, mailbox octets).
    pub async fn stat(&mut self) -> Result<(u32, u64)> {
        let line = self.query("STAT").await?;
        parse_stat(&line).ok_or_else(|| Error::Protocol(format!("unparseable STAT reply: {line}")))
    }

    /// `LIST <refno>` → message size in octets.
    pub async fn list(&mut self, refno: u32) -> Result<u64> {
        let line = self.query(&format!("LIST {refno}")).await?;
        // "+OK <refno> <octets>"
        line.split_whitespace()
            .nth(2)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Protocol(format!("unparseable LIST reply: {line}")))
    }

    /// `LAST` → highest message number already seen, 0 when none.
    pub async fn last(&mut self) -> Result<u32> {
        let line = self.query("LAST").await?;
        line.split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Protocol(format!("unparseable LAST reply: {line}")))
    }

    /// Stream the `UIDL` listing, invoking `each(refno, uidl)` per
    /// message. Transitions the UIDL capability on first use; an empty
    /// listing for a non-empty mailbox counts as "unsupported".
    pub async fn uidl<F>(&mut self, mut each: F) -> Result<()>
    where
        F: FnMut(u32, &str) -> Result<()>,
    {
        if let Err(e) = self.query("UIDL").await {
            if matches!(e, Error::Protocol(_)) && self.uidl == Capability::Unknown {
                self.demote_uidl();
            }
            return Err(e);
        }

        let mut lines = 0u32;
        self.stream_lines(|line| {
            let mut parts = line.splitn(2, ' ');
            let refno = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Protocol(format!("bad UIDL line: {line}")))?;
            let uidl = parts.next().unwrap_or("").trim();
            if uidl.is_empty() {
                return Err(Error::Protocol(format!("bad UIDL line: {line}")));
            }
            lines += 1;
            each(refno, uidl)
        })
        .await?;

        if lines == 0 && self.msg_count > 0 {
            // A server that answers UIDL with an empty listing for a
            // non-empty mailbox does not really support it.
            self.demote_uidl();
            return Err(Error::Protocol(self.err_msg.clone()));
        }
        if self.uidl == Capability::Unknown {
            debug!("set UIDL capability");
            self.uidl = Capability::Present;
        }
        Ok(())
    }

    fn demote_uidl(&mut self) {
        debug!("unset UIDL capability");
        self.uidl = Capability::Absent;
        self.err_msg = "The command UIDL is not supported by the server.".to_string();
    }

    /// `TOP <refno> 0`: stream the headers of one message. Transitions
    /// the TOP capability on first use.
    pub async fn top<F>(&mut self, refno: u32, line_cb: F) -> Result<()>
    where
        F: FnMut(&mut String) -> Result<()>,
    {
        if let Err(e) = self.query(&format!("TOP {refno} 0")).await {
            if matches!(e, Error::Protocol(_)) && self.top == Capability::Unknown {
                debug!("unset TOP capability");
                self.top = Capability::Absent;
                self.err_msg = "The command TOP is not supported by the server.".to_string();
            }
            return Err(e);
        }
        self.stream_lines(line_cb).await?;
        if self.top == Capability::Unknown {
            debug!("set TOP capability");
            self.top = Capability::Present;
        }
        Ok(())
    }

    /// `RETR <refno>`: stream one whole message.
    pub async fn retr<F>(&mut self, refno: u32, line_cb: F) -> Result<()>
    where
        F: FnMut(&mut String) -> Result<()>,
    {
        self.fetch_data(&format!("RETR {refno}"), line_cb).await
    }

    /// `DELE <refno>`. The deletion takes effect at QUIT.
    pub async fn dele(&mut self, refno: u32) -> Result<()> {
        self.query(&format!("DELE {refno}")).await.map(|_| ())
    }

    /// `RSET`: un-mark everything marked for deletion.
    pub async fn rset(&mut self) -> Result<()> {
        self.query("RSET").await.map(|_| ())
    }

    /// Send `QUIT` and close. On `+OK` the server commits deletions.
    pub async fn quit(&mut self) -> Result<()> {
        self.status = SessionStatus::ByeSent;
        let result = self.query("QUIT").await;
        self.status = SessionStatus::Disconnected;
        self.release().await;
        result.map(|_| ())
    }

    /// Drop the connection without protocol goodbye.
    pub async fn release(&mut self) {
        if let Some(mut t) = self.transport.take() {
            t.shutdown().await;
        }
        if self.status == SessionStatus::Authenticated {
            self.status = SessionStatus::Disconnected;
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::Transport("not connected".into()))?;
        match transport.read_line().await {
            Ok(line) => Ok(line),
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::Transport("not connected".into()))?;
        match transport.write_line(line).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    /// Transport-level failure (or user interrupt): the connection is
    /// unusable; close it and mark the session disconnected.
    async fn fail(&mut self, err: &Error) {
        debug!("closing connection: {err}");
        self.release().await;
        self.status = SessionStatus::Disconnected;
    }
}

/// Extract the APOP challenge (`<...>`) from the greeting line.
fn parse_timestamp(greeting: &str) -> Option<String> {
    let start = greeting.find('<')?;
    let end = greeting[start..].find('>')?;
    Some(greeting[start..start + end + 1].to_string())
}

/// APOP digest: lower-case hex MD5 of challenge ++ password.
fn apop_digest(timestamp: &str, password: &str) -> String {
    let digest = Md5::new()
        .chain_update(timestamp)
        .chain_update(password)
        .finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn parse_stat(line: &str) -> Option<(u32, u64)> {
    let mut parts = line.split_whitespace();
    parts.next()?; // "+OK"
    let count = parts.next()?.parse().ok()?;
    let size = parts.next()?.parse().ok()?;
    Some((count, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_is_the_bracketed_challenge() {
        assert_eq!(
            parse_timestamp("+OK POP3 ready <1896.697170952@dbc.mtview.ca.us>").as_deref(),
            Some("<1896.697170952@dbc.mtview.ca.us>")
        );
        assert_eq!(parse_timestamp("+OK POP3 ready"), None);
        assert_eq!(parse_timestamp("+OK <unterminated"), None);
    }

    #[test]
    fn apop_digest_matches_rfc_1939_example() {
        // The worked example from RFC 1939 section 7.
        assert_eq!(
            apop_digest("<1896.697170952@dbc.mtview.ca.us>", "tanstaaf"),
            "c4c9334bac560ecc979e58001b3e22fb"
        );
    }

    #[test]
    fn stat_parsing() {
        assert_eq!(parse_stat("+OK 2 512"), Some((2, 512)));
        assert_eq!(parse_stat("+OK 0 0"), Some((0, 0)));
        assert_eq!(parse_stat("+OK"), None);
        assert_eq!(parse_stat("+OK two many"), None);
    }
}
