//! Shared I/O helpers for the fake POP3 server.
//!
//! Thin wrappers over `AsyncWriteExt` that flush after every write;
//! eager flushing keeps the test server simple and deterministic.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Write one protocol line (CRLF appended) and flush.
pub async fn write_line<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    line: &str,
) -> std::io::Result<()> {
    stream.get_mut().write_all(line.as_bytes()).await?;
    stream.get_mut().write_all(b"\r\n").await?;
    stream.get_mut().flush().await
}

/// Send multi-line data: each line dot-stuffed and CRLF-terminated,
/// closed with the lone-dot terminator.
pub async fn write_multiline<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    lines: &[String],
) -> std::io::Result<()> {
    for line in lines {
        if line.starts_with('.') {
            stream.get_mut().write_all(b".").await?;
        }
        stream.get_mut().write_all(line.as_bytes()).await?;
        stream.get_mut().write_all(b"\r\n").await?;
    }
    stream.get_mut().write_all(b".\r\n").await?;
    stream.get_mut().flush().await
}

/// Split raw message bytes into protocol lines, tolerating both CRLF
/// and bare LF in the test data.
pub fn message_lines(raw: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(raw);
    let mut lines: Vec<String> = text.split('\n').map(|l| l.trim_end_matches('\r').to_string()).collect();
    // A trailing newline in the data is not an extra empty line on the
    // wire.
    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}
