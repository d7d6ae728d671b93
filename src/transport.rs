//! Buffered line transport over TCP or TLS
//!
//! POP3 is a line protocol, so the transport exposes line-level reads
//! with `\r\n` stripping on top of a buffered socket. The same
//! [`Transport`] carries plaintext and TLS traffic: `STLS` (and
//! `pops://` connects) swap the underlying stream in place via
//! [`Transport::upgrade_tls`], the way the C original re-pointed the
//! connection's read/write vectors at the TLS record layer.
//!
//! Every read and write races the process [`Interrupt`] flag. An
//! interrupted operation fails with [`Error::Aborted`], distinguishable
//! from network failure; the caller closes the connection and surfaces
//! the error rather than retrying.

use std::pin::Pin;
use std::task::{Context, Poll as TaskPoll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::interrupt::Interrupt;

/// Result of a bounded readability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Data is buffered or the socket is readable.
    Ready,
    /// Nothing arrived within the timeout.
    Empty,
}

/// The wire, before or after the TLS upgrade.
enum Stream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> TaskPoll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> TaskPoll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> TaskPoll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> TaskPoll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A buffered, interruptible connection to one server.
pub struct Transport {
    reader: BufReader<Stream>,
    host: String,
    interrupt: Interrupt,
}

impl Transport {
    /// Open a TCP connection.
    ///
    /// The timeout bounds connection establishment only; once the stream
    /// is up, reads are bounded by [`Transport::poll`], not by a
    /// per-read timeout.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] on resolution failure, refusal, or timeout;
    /// [`Error::Aborted`] when interrupted mid-connect.
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        interrupt: Interrupt,
    ) -> Result<Self> {
        debug!("Connecting to {host}:{port}");

        let connect = TcpStream::connect((host, port));
        let stream = tokio::select! {
            res = tokio::time::timeout(timeout, connect) => match res {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(Error::Transport(format!("could not connect to {host}: {e}")))
                }
                Err(_) => {
                    return Err(Error::Transport(format!("connection to {host} timed out")))
                }
            },
            () = interrupt.raised() => {
                interrupt.clear();
                return Err(Error::Aborted);
            }
        };

        Ok(Self {
            reader: BufReader::new(Stream::Plain(stream)),
            host: host.to_string(),
            interrupt,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.reader.get_ref(), Stream::Tls(_))
    }

    /// Read one logical line, with the trailing `\r\n` (or bare `\n`)
    /// stripped. Bytes outside UTF-8 are replaced rather than treated
    /// as an error; 8-bit mail still comes through line by line.
    ///
    /// # Errors
    ///
    /// A closed peer surfaces as [`Error::Transport`]; an interrupt as
    /// [`Error::Aborted`].
    pub async fn read_line(&mut self) -> Result<String> {
        let mut raw = Vec::new();
        let n = tokio::select! {
            res = self.reader.read_until(b'\n', &mut raw) => res
                .map_err(|e| Error::Transport(format!("error talking to {}: {e}", self.host)))?,
            () = self.interrupt.raised() => {
                self.interrupt.clear();
                return Err(Error::Aborted);
            }
        };
        if n == 0 {
            return Err(Error::Transport(format!(
                "connection to {} closed",
                self.host
            )));
        }

        if raw.ends_with(b"\n") {
            raw.pop();
            if raw.ends_with(b"\r") {
                raw.pop();
            }
        }
        let line = String::from_utf8_lossy(&raw).into_owned();
        trace!("< {line}");
        Ok(line)
    }

    /// Write raw bytes and flush.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.reader.get_mut();
        let write = async {
            stream.write_all(buf).await?;
            stream.flush().await
        };
        tokio::select! {
            res = write => res
                .map_err(|e| Error::Transport(format!("error talking to {}: {e}", self.host))),
            () = self.interrupt.raised() => {
                self.interrupt.clear();
                Err(Error::Aborted)
            }
        }
    }

    /// Write one command line, appending `\r\n`.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        trace!("> {line}");
        let mut buf = Vec::with_capacity(line.len() + 2);
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.write_all(&buf).await
    }

    /// Check whether a read would block, waiting at most `timeout`.
    ///
    /// Buffered bytes count as [`Readiness::Ready`]; so does a closed
    /// peer (the next read then reports the close).
    pub async fn poll(&mut self, timeout: Duration) -> Result<Readiness> {
        if !self.reader.buffer().is_empty() {
            return Ok(Readiness::Ready);
        }
        tokio::select! {
            res = tokio::time::timeout(timeout, self.reader.fill_buf()) => match res {
                Ok(Ok(_)) => Ok(Readiness::Ready),
                Ok(Err(e)) => Err(Error::Transport(format!(
                    "error talking to {}: {e}",
                    self.host
                ))),
                Err(_) => Ok(Readiness::Empty),
            },
            () = self.interrupt.raised() => {
                self.interrupt.clear();
                Err(Error::Aborted)
            }
        }
    }

    /// Upgrade the connection to TLS, for both `pops://` connects and
    /// `STLS`. Consumes the transport and returns the TLS-wrapped one.
    ///
    /// # Errors
    ///
    /// [`Error::Trust`] when the handshake (or the certificate
    /// verification inside it) fails, or when plaintext is still
    /// buffered — the server must not send anything between its `STLS`
    /// confirmation and the handshake.
    pub async fn upgrade_tls(
        self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<Self> {
        if !self.reader.buffer().is_empty() {
            return Err(Error::Trust(
                "unexpected plaintext before TLS handshake".into(),
            ));
        }
        let tcp = match self.reader.into_inner() {
            Stream::Plain(tcp) => tcp,
            Stream::Tls(_) => return Err(Error::Trust("connection is already TLS".into())),
        };

        let tls = tokio::select! {
            res = connector.connect(server_name, tcp) => {
                res.map_err(|e| Error::Trust(e.to_string()))?
            }
            () = self.interrupt.raised() => {
                self.interrupt.clear();
                return Err(Error::Aborted);
            }
        };
        debug!("TLS established with {}", self.host);

        Ok(Self {
            reader: BufReader::new(Stream::Tls(Box::new(tls))),
            host: self.host,
            interrupt: self.interrupt,
        })
    }

    /// Best-effort orderly shutdown. Errors are ignored; the connection
    /// is unusable afterwards either way.
    pub async fn shutdown(&mut self) {
        let _ = self.reader.get_mut().shutdown().await;
    }
}
