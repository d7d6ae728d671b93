//! Message envelope extraction
//!
//! The mailbox view only needs a handful of header fields; full RFC 822
//! parsing is `mailparse`'s job. The [`Envelope`] is what gets
//! serialized into the header cache, so it derives serde and must stay
//! backward-readable.

use mailparse::MailHeaderMap;
use serde::{Deserialize, Serialize};

/// The displayable subset of a message's headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    /// The raw Date: header value.
    pub date: String,
    /// Seconds since the epoch parsed from `date`; 0 when unparseable.
    pub date_epoch: i64,
    pub message_id: String,
}

impl Envelope {
    /// Parse an envelope out of raw header bytes (a full message also
    /// works; body bytes after the blank line are ignored).
    ///
    /// Unparseable input yields an empty envelope rather than an error:
    /// a message we cannot parse is still a message the user can fetch
    /// and delete.
    pub fn parse(raw: &[u8]) -> Self {
        let Ok((headers, _)) = mailparse::parse_headers(raw) else {
            return Self::default();
        };

        let date = headers.get_first_value("Date").unwrap_or_default();
        Self {
            from: headers.get_first_value("From").unwrap_or_default(),
            to: headers.get_first_value("To").unwrap_or_default(),
            cc: headers.get_first_value("Cc").unwrap_or_default(),
            subject: headers.get_first_value("Subject").unwrap_or_default(),
            date_epoch: mailparse::dateparse(&date).unwrap_or(0),
            date,
            message_id: headers.get_first_value("Message-ID").unwrap_or_default(),
        }
    }

    /// Byte offset where the body starts (one past the blank separator
    /// line), or the input length when there is no body.
    pub fn body_offset(raw: &[u8]) -> usize {
        mailparse::parse_headers(raw)
            .map(|(_, offset)| offset)
            .unwrap_or(raw.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"From: alice@example.com\r\n\
        To: bob@example.com\r\n\
        Subject: Hello Bob\r\n\
        Date: Mon, 01 Jan 2024 12:00:00 +0000\r\n\
        Message-ID: <one@example.com>\r\n\
        \r\n\
        Body text\r\n";

    #[test]
    fn parses_the_usual_fields() {
        let env = Envelope::parse(RAW);
        assert_eq!(env.from, "alice@example.com");
        assert_eq!(env.to, "bob@example.com");
        assert_eq!(env.subject, "Hello Bob");
        assert_eq!(env.message_id, "<one@example.com>");
        assert_eq!(env.date_epoch, 1_704_110_400);
    }

    #[test]
    fn missing_headers_become_empty_strings() {
        let env = Envelope::parse(b"Subject: only a subject\r\n\r\n");
        assert_eq!(env.subject, "only a subject");
        assert!(env.from.is_empty());
        assert_eq!(env.date_epoch, 0);
    }

    #[test]
    fn body_offset_points_past_the_separator() {
        let offset = Envelope::body_offset(RAW);
        assert_eq!(&RAW[offset..], b"Body text\r\n");
    }

    #[test]
    fn survives_garbage() {
        let env = Envelope::parse(&[0xff, 0xfe, 0x00]);
        assert_eq!(env, Envelope::default());
    }
}
