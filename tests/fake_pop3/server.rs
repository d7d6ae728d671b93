//! In-process fake POP3 server
//!
//! # How POP3 works (educational overview)
//!
//! POP3 (Post Office Protocol, RFC 1939) is a line-based protocol for
//! draining a remote maildrop. Unlike IMAP there are no folders or
//! server-side flags: the server numbers the messages 1..N at session
//! start, the client fetches what it wants, marks some for deletion,
//! and everything marked is deleted atomically when the client QUITs.
//!
//! ```text
//!   Client connects via TCP
//!       |
//!   Server greeting: "+OK POP3 ready\r\n"
//!       |
//!   (optionally STLS: upgrade the connection to TLS)
//!       |
//!   USER / PASS authentication
//!       |
//!   STAT, UIDL, LIST, TOP, RETR, DELE ...
//!       |
//!   QUIT (deletions take effect now)
//! ```
//!
//! Multi-line responses (UIDL, LIST, TOP, RETR) end with a line holding
//! only `.`; data lines that start with `.` get a second `.` prepended
//! on the wire (dot-stuffing), which the client strips.
//!
//! Message numbers are fixed for the whole session: `DELE 2` makes
//! number 2 invalid but does not renumber 3..N. A reconnecting client
//! therefore re-learns all numbers from a fresh `UIDL` listing -- which
//! is exactly the behaviour these tests exercise.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use super::io::{message_lines, write_line, write_multiline};
use super::maildrop::Maildrop;

/// How the server offers TLS.
pub enum ServerTls {
    /// Plaintext only; `STLS` is rejected.
    None,
    /// TLS from the first byte (`pops://` style).
    Immediate {
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    },
    /// Plaintext greeting, TLS after `STLS`.
    StartTls {
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    },
}

#[derive(Clone)]
enum Mode {
    Plain,
    Immediate(TlsAcceptor),
    StartTls(TlsAcceptor),
}

/// A fake POP3 server on localhost with an OS-assigned port.
pub struct FakePop3Server {
    port: u16,
    maildrop: Arc<Mutex<Maildrop>>,
    /// Handle to the accept loop so it lives as long as the server.
    _handle: tokio::task::JoinHandle<()>,
}

impl FakePop3Server {
    /// Start a plaintext server over the given maildrop.
    pub async fn start(maildrop: Maildrop) -> Self {
        Self::start_with(maildrop, ServerTls::None).await
    }

    /// Start with the given TLS offering. Certificates come from the
    /// test (rcgen), so each test controls the names it presents.
    pub async fn start_with(maildrop: Maildrop, tls: ServerTls) -> Self {
        // Multiple tests race to install the provider; losing the race
        // is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let mode = match tls {
            ServerTls::None => Mode::Plain,
            ServerTls::Immediate { chain, key } => Mode::Immediate(acceptor(chain, key)),
            ServerTls::StartTls { chain, key } => Mode::StartTls(acceptor(chain, key)),
        };

        let maildrop = Arc::new(Mutex::new(maildrop));
        let shared = Arc::clone(&maildrop);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let mode = mode.clone();
                let maildrop = Arc::clone(&shared);
                tokio::spawn(async move {
                    handle_connection(stream, mode, maildrop).await;
                });
            }
        });

        Self {
            port,
            maildrop,
            _handle: handle,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The shared maildrop: mutate it between connections to simulate
    /// server-side changes, or inspect the command log.
    pub fn maildrop(&self) -> Arc<Mutex<Maildrop>> {
        Arc::clone(&self.maildrop)
    }
}

fn acceptor(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> TlsAcceptor {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .expect("build server TLS config");
    TlsAcceptor::from(Arc::new(config))
}

async fn handle_connection(stream: TcpStream, mode: Mode, maildrop: Arc<Mutex<Maildrop>>) {
    match mode {
        Mode::Plain => {
            let mut reader = BufReader::new(stream);
            if write_line(&mut reader, "+OK POP3 fake server ready").await.is_err() {
                return;
            }
            session_loop(reader, &maildrop, false).await;
        }
        Mode::Immediate(acceptor) => {
            let Ok(tls_stream) = acceptor.accept(stream).await else {
                return;
            };
            let mut reader = BufReader::new(tls_stream);
            if write_line(&mut reader, "+OK POP3 fake server ready").await.is_err() {
                return;
            }
            session_loop(reader, &maildrop, false).await;
        }
        Mode::StartTls(acceptor) => {
            let mut reader = BufReader::new(stream);
            if write_line(&mut reader, "+OK POP3 fake server ready").await.is_err() {
                return;
            }
            // Run plaintext until the client asks to upgrade; after
            // the handshake the same command loop continues over TLS.
            if let LoopEnd::Upgrade(tcp) = session_loop(reader, &maildrop, true).await {
                let Ok(tls_stream) = acceptor.accept(tcp).await else {
                    return;
                };
                session_loop(BufReader::new(tls_stream), &maildrop, false).await;
            }
        }
    }
}

enum LoopEnd<S> {
    Done,
    Upgrade(S),
}

/// One authenticated-or-not command loop over an established stream.
///
/// Message numbers are snapshotted at loop entry, the way a real
/// server fixes them at session start.
async fn session_loop<S: AsyncRead + AsyncWrite + Unpin>(
    mut reader: BufReader<S>,
    maildrop: &Arc<Mutex<Maildrop>>,
    allow_stls: bool,
) -> LoopEnd<S> {
    let snapshot: Vec<String> = {
        let state = maildrop.lock().unwrap();
        state.messages.iter().map(|m| m.uidl.clone()).collect()
    };
    let mut deleted: HashSet<usize> = HashSet::new();

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return LoopEnd::Done, // connection closed
            Ok(_) => {}
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        maildrop.lock().unwrap().log.push(trimmed.to_string());

        let mut parts = trimmed.split_whitespace();
        let cmd = parts.next().unwrap_or("").to_uppercase();
        let arg1: Option<u32> = parts.next().and_then(|s| s.parse().ok());

        match cmd.as_str() {
            "USER" | "PASS" | "NOOP" => {
                if write_line(&mut reader, "+OK").await.is_err() {
                    return LoopEnd::Done;
                }
            }
            "STLS" => {
                if allow_stls {
                    if write_line(&mut reader, "+OK begin TLS negotiation").await.is_err() {
                        return LoopEnd::Done;
                    }
                    return LoopEnd::Upgrade(reader.into_inner());
                }
                if write_line(&mut reader, "-ERR STLS not supported").await.is_err() {
                    return LoopEnd::Done;
                }
            }
            "STAT" => {
                let (count, size) = {
                    let state = maildrop.lock().unwrap();
                    let live = live_messages(&state, &snapshot, &deleted);
                    (live.len(), live.iter().map(|(_, _, size)| size).sum::<usize>())
                };
                if write_line(&mut reader, &format!("+OK {count} {size}")).await.is_err() {
                    return LoopEnd::Done;
                }
            }
            "UIDL" => {
                let response = {
                    let state = maildrop.lock().unwrap();
                    if !state.uidl_enabled {
                        None
                    } else if state.uidl_empty {
                        Some(Vec::new())
                    } else {
                        Some(
                            live_messages(&state, &snapshot, &deleted)
                                .iter()
                                .map(|(refno, uidl, _)| format!("{refno} {uidl}"))
                                .collect::<Vec<_>>(),
                        )
                    }
                };
                match response {
                    Some(lines) => {
                        if write_line(&mut reader, "+OK").await.is_err()
                            || write_multiline(&mut reader, &lines).await.is_err()
                        {
                            return LoopEnd::Done;
                        }
                    }
                    None => {
                        if write_line(&mut reader, "-ERR UIDL command not implemented")
                            .await
                            .is_err()
                        {
                            return LoopEnd::Done;
                        }
                    }
                }
            }
            "LIST" => match arg1 {
                Some(refno) => {
                    let size = {
                        let state = maildrop.lock().unwrap();
                        resolve(&state, &snapshot, &deleted, refno).map(|raw| raw.len())
                    };
                    let reply = match size {
                        Some(size) => format!("+OK {refno} {size}"),
                        None => "-ERR no such message".to_string(),
                    };
                    if write_line(&mut reader, &reply).await.is_err() {
                        return LoopEnd::Done;
                    }
                }
                None => {
                    let lines = {
                        let state = maildrop.lock().unwrap();
                        live_messages(&state, &snapshot, &deleted)
                            .iter()
                            .map(|(refno, _, size)| format!("{refno} {size}"))
                            .collect::<Vec<_>>()
                    };
                    if write_line(&mut reader, "+OK").await.is_err()
                        || write_multiline(&mut reader, &lines).await.is_err()
                    {
                        return LoopEnd::Done;
                    }
                }
            },
            "TOP" => {
                let response = {
                    let state = maildrop.lock().unwrap();
                    if !state.top_enabled {
                        None
                    } else {
                        arg1.and_then(|refno| resolve(&state, &snapshot, &deleted, refno))
                            .map(|raw| header_lines(&raw))
                    }
                };
                match response {
                    Some(lines) => {
                        if write_line(&mut reader, "+OK").await.is_err()
                            || write_multiline(&mut reader, &lines).await.is_err()
                        {
                            return LoopEnd::Done;
                        }
                    }
                    None => {
                        let msg = if maildrop.lock().unwrap().top_enabled {
                            "-ERR no such message"
                        } else {
                            "-ERR TOP command not implemented"
                        };
                        if write_line(&mut reader, msg).await.is_err() {
                            return LoopEnd::Done;
                        }
                    }
                }
            }
            "RETR" => {
                let response = {
                    let state = maildrop.lock().unwrap();
                    arg1.and_then(|refno| resolve(&state, &snapshot, &deleted, refno))
                        .map(|raw| message_lines(&raw))
                };
                match response {
                    Some(lines) => {
                        if write_line(&mut reader, "+OK").await.is_err()
                            || write_multiline(&mut reader, &lines).await.is_err()
                        {
                            return LoopEnd::Done;
                        }
                    }
                    None => {
                        if write_line(&mut reader, "-ERR no such message").await.is_err() {
                            return LoopEnd::Done;
                        }
                    }
                }
            }
            "DELE" => {
                let reply = match arg1 {
                    Some(refno)
                        if refno >= 1
                            && (refno as usize) <= snapshot.len()
                            && !deleted.contains(&(refno as usize - 1)) =>
                    {
                        deleted.insert(refno as usize - 1);
                        format!("+OK message {refno} deleted")
                    }
                    _ => "-ERR no such message".to_string(),
                };
                if write_line(&mut reader, &reply).await.is_err() {
                    return LoopEnd::Done;
                }
            }
            "RSET" => {
                deleted.clear();
                if write_line(&mut reader, "+OK").await.is_err() {
                    return LoopEnd::Done;
                }
            }
            "LAST" => {
                let reply = match maildrop.lock().unwrap().last {
                    Some(n) => format!("+OK {n}"),
                    None => "-ERR LAST command not implemented".to_string(),
                };
                if write_line(&mut reader, &reply).await.is_err() {
                    return LoopEnd::Done;
                }
            }
            "QUIT" => {
                // Deletions become effective only now.
                {
                    let mut state = maildrop.lock().unwrap();
                    let doomed: HashSet<&String> =
                        deleted.iter().map(|&i| &snapshot[i]).collect();
                    state.messages.retain(|m| !doomed.contains(&m.uidl));
                }
                let _ = write_line(&mut reader, "+OK bye").await;
                return LoopEnd::Done;
            }
            _ => {
                if write_line(&mut reader, "-ERR unknown command").await.is_err() {
                    return LoopEnd::Done;
                }
            }
        }
    }
}

/// The messages still addressable in this session:
/// (refno, uidl, size), excluding session-deleted numbers and
/// messages that vanished from the shared drop.
fn live_messages(
    state: &Maildrop,
    snapshot: &[String],
    deleted: &HashSet<usize>,
) -> Vec<(u32, String, usize)> {
    let mut live = Vec::new();
    for (i, uidl) in snapshot.iter().enumerate() {
        if deleted.contains(&i) {
            continue;
        }
        if let Some(msg) = state.messages.iter().find(|m| &m.uidl == uidl) {
            live.push((i as u32 + 1, uidl.clone(), msg.raw.len()));
        }
    }
    live
}

fn resolve(
    state: &Maildrop,
    snapshot: &[String],
    deleted: &HashSet<usize>,
    refno: u32,
) -> Option<Vec<u8>> {
    let idx = (refno as usize).checked_sub(1)?;
    if deleted.contains(&idx) {
        return None;
    }
    let uidl = snapshot.get(idx)?;
    state.messages
        .iter()
        .find(|m| &m.uidl == uidl)
        .map(|m| m.raw.clone())
}

/// The header section of a message: everything up to and including the
/// blank separator line (what `TOP n 0` returns).
fn header_lines(raw: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    for line in message_lines(raw) {
        let end = line.is_empty();
        lines.push(line);
        if end {
            break;
        }
    }
    lines
}
