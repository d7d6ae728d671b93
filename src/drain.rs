//! Drain a POP mailbox into a local mail store
//!
//! The classic "fetch mail" operation: pull every (or every unseen)
//! message from the server, append it to the local spool, and
//! optionally delete it server-side. This is a one-shot connection
//! with no mailbox view and no caches; it exists alongside
//! [`PopMailbox`](crate::PopMailbox) for the drain-to-spool workflow.

use tracing::{debug, info, warn};

use crate::config::{AccountConfig, PopConfig, QuadOption};
use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use crate::protocol::PopSession;
use crate::tls::TlsEngine;

/// Destination for drained messages. Each append is expected to be
/// committed (durable) when it returns.
pub trait MailStore: Send {
    fn append(&mut self, raw: &[u8]) -> std::io::Result<()>;
}

/// Yes/no question collaborator for the ask-variants of
/// [`QuadOption`].
pub trait Confirm {
    fn confirm(&self, question: &str) -> bool;
}

fn resolve_quad(option: QuadOption, confirm: Option<&dyn Confirm>, question: &str) -> bool {
    match option {
        QuadOption::Yes => true,
        QuadOption::No => false,
        QuadOption::AskYes => confirm.map_or(true, |c| c.confirm(question)),
        QuadOption::AskNo => confirm.map_or(false, |c| c.confirm(question)),
    }
}

/// Fetch new messages from a POP server into `store`.
///
/// `source` overrides the configured drain host; either may be a bare
/// hostname (given `pop://` and the default port) or a full
/// `pop[s]://` URL. With `use_last` set, the server's `LAST` value
/// limits the fetch to unseen messages. Returns the number of
/// messages stored.
///
/// # Errors
///
/// [`Error::Config`] when no host is configured; store write failures
/// surface as [`Error::Integrity`] after an `RSET` has made sure
/// nothing gets deleted server-side.
pub async fn fetch_mail(
    source: Option<&str>,
    account_pass: Option<&str>,
    config: &PopConfig,
    tls: &TlsEngine,
    interrupt: Interrupt,
    store: &mut dyn MailStore,
    confirm: Option<&dyn Confirm>,
) -> Result<usize> {
    let Some(host) = source.or(config.drain_host.as_deref()) else {
        return Err(Error::Config("POP host is not defined".into()));
    };
    let url = if host.contains("://") {
        host.to_string()
    } else {
        format!("pop://{host}")
    };

    let mut account = AccountConfig::from_url(&url)?;
    if account.pass.is_none() {
        account.pass = account_pass.map(str::to_string);
    }

    let mut session = PopSession::open(&account, config, tls, interrupt).await?;
    info!("Checking for new messages...");

    let total = session.message_count();

    // Only fetch what the server says we have not seen yet.
    let mut last = 0;
    if config.use_last && total > 0 {
        match session.last().await {
            Ok(n) => last = n,
            // Optional command; a server rejection just means "fetch
            // everything".
            Err(Error::Protocol(_)) => debug!("server does not support LAST"),
            Err(e) => return Err(e),
        }
    }

    if total <= last {
        info!("No new mail in POP mailbox.");
        let _ = session.quit().await;
        return Ok(0);
    }

    let delete = resolve_quad(
        config.delete_on_drain,
        confirm,
        "Delete messages from server?",
    );
    info!("Reading new messages ({} total)...", total - last);

    let mut fetched = 0;
    let mut rset = false;
    let mut failure = None;

    for refno in last + 1..=total {
        let mut raw = Vec::new();
        let streamed = session
            .retr(refno, |line| {
                raw.extend_from_slice(line.as_bytes());
                raw.push(b'\n');
                Ok(())
            })
            .await;
        match streamed {
            Ok(()) => {}
            Err(e @ Error::Protocol(_)) => {
                warn!("{}", session.err_msg());
                failure = Some(e);
                break;
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = store.append(&raw) {
            // The local side failed; make sure nothing already marked
            // gets deleted at QUIT.
            warn!("Error while writing mailbox: {e}");
            rset = true;
            failure = Some(Error::Integrity(format!("error while writing mailbox: {e}")));
            break;
        }
        fetched += 1;

        if delete {
            match session.dele(refno).await {
                Ok(()) => {}
                Err(e @ Error::Protocol(_)) => {
                    warn!("{}", session.err_msg());
                    failure = Some(e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        info!("{fetched} of {} messages read", total - last);
    }

    if rset {
        session.rset().await?;
    }
    let _ = session.quit().await;

    match failure {
        Some(e) => Err(e),
        None => Ok(fetched),
    }
}
