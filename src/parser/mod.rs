//! Raw email → command candidate.
//!
//! [`EmailParser::parse_email`] never fails: a message mail-parser cannot
//! make sense of degrades to its lossy UTF-8 text with an empty sender.

pub mod text;
pub mod whitelist;

use mail_parser::{Message, MessageParser, PartType};
use serde::Serialize;
use tracing::{debug, warn};

pub use text::{decode_header, html_to_text, sender_address, strip_replies};
pub use whitelist::{Whitelist, normalize_address};

/// Structured result of parsing one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedEmail {
    /// Normalized sender address, `""` when absent.
    pub sender: String,
    pub subject: String,
    /// Body text with quoted replies removed.
    pub command: String,
    pub message_id: Option<String>,
    pub is_whitelisted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EmailParser {
    whitelist: Whitelist,
}

impl EmailParser {
    pub fn new<I, S>(whitelist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            whitelist: Whitelist::new(whitelist),
        }
    }

    /// Replace the whitelist.
    pub fn set_whitelist<I, S>(&mut self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.whitelist = Whitelist::new(addresses);
        debug!(entries = self.whitelist.len(), "Whitelist updated");
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn is_sender_whitelisted(&self, address: &str) -> bool {
        self.whitelist.contains(address)
    }

    /// Address from the `From` header, or `""` if there is none.
    pub fn extract_sender(&self, message: &Message<'_>) -> String {
        message
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| {
                a.address().map(str::to_string).or_else(|| {
                    a.name()
                        .map(sender_address)
                        .filter(|s| s.contains('@'))
                })
            })
            .unwrap_or_default()
    }

    /// Body text of the message, preferring a plain-text part over HTML.
    pub fn extract_command(&self, message: &Message<'_>) -> String {
        let plain = message.text_bodies().find_map(|part| match &part.body {
            PartType::Text(text) => Some(text.to_string()),
            _ => None,
        });
        let body = plain
            .or_else(|| {
                message.html_bodies().find_map(|part| match &part.body {
                    PartType::Html(html) => Some(html_to_text(html)),
                    _ => None,
                })
            })
            .unwrap_or_default();

        strip_replies(&body).trim().to_string()
    }

    /// Decode the Subject from its raw header bytes, so a decoded value is
    /// never run through RFC 2047 decoding a second time.
    fn extract_subject(&self, message: &Message<'_>) -> String {
        match message.header_raw("Subject") {
            Some(raw) => decode_header(raw.replace(['\r', '\n'], "").trim()),
            None => message.subject().unwrap_or_default().to_string(),
        }
    }

    /// Run the full pipeline over raw message bytes.
    pub fn parse_email(&self, raw: &[u8]) -> ParsedEmail {
        let Some(message) = MessageParser::default().parse(raw) else {
            warn!(bytes = raw.len(), "Unparseable message, using raw text");
            let body = String::from_utf8_lossy(raw);
            return ParsedEmail {
                sender: String::new(),
                subject: String::new(),
                command: strip_replies(&body).trim().to_string(),
                message_id: None,
                is_whitelisted: self.is_sender_whitelisted(""),
            };
        };

        let sender = normalize_address(&self.extract_sender(&message));
        let subject = self.extract_subject(&message);
        let command = self.extract_command(&message);
        let message_id = message.message_id().map(str::to_string);
        let is_whitelisted = self.is_sender_whitelisted(&sender);

        debug!(
            sender = %sender,
            subject = %subject,
            whitelisted = is_whitelisted,
            command_len = command.len(),
            "Parsed email"
        );

        ParsedEmail {
            sender,
            subject,
            command,
            message_id,
            is_whitelisted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"From: test@example.com
To: claude@bridge.com
Subject: Test Command
Message-ID: <test123@example.com>

This is a test command.
";

    fn parse(raw: &str) -> Message<'_> {
        MessageParser::default().parse(raw.as_bytes()).unwrap()
    }

    // ── Whitelist ───────────────────────────────────────────────────

    #[test]
    fn set_whitelist_replaces_entries() {
        let mut parser = EmailParser::new(["old@example.com"]);
        assert!(parser.is_sender_whitelisted("old@example.com"));
        assert!(!parser.is_sender_whitelisted("new@example.com"));

        parser.set_whitelist(["new@example.com"]);
        assert!(!parser.is_sender_whitelisted("old@example.com"));
        assert!(parser.is_sender_whitelisted("new@example.com"));
    }

    #[test]
    fn whitelist_blocks_lookalikes() {
        let parser = EmailParser::new(["admin@example.com"]);
        assert!(!parser.is_sender_whitelisted("fakeadmin@example.com.evil.com"));
        assert!(!parser.is_sender_whitelisted("admin@example.com.attacker.com"));
        assert!(!parser.is_sender_whitelisted("xadmin@example.com"));
        assert!(parser.is_sender_whitelisted("ADMIN@example.com"));
    }

    // ── Sender ──────────────────────────────────────────────────────

    #[test]
    fn extract_sender_simple() {
        let msg = parse("From: user@example.com\n\nbody\n");
        assert_eq!(EmailParser::default().extract_sender(&msg), "user@example.com");
    }

    #[test]
    fn extract_sender_with_angle_brackets() {
        let msg = parse("From: John Doe <john@example.com>\n\nbody\n");
        assert_eq!(EmailParser::default().extract_sender(&msg), "john@example.com");
    }

    #[test]
    fn extract_sender_empty() {
        let msg = parse("From: \nSubject: hi\n\nbody\n");
        assert_eq!(EmailParser::default().extract_sender(&msg), "");
    }

    #[test]
    fn extract_sender_missing_header() {
        let msg = parse("Subject: hi\n\nbody\n");
        assert_eq!(EmailParser::default().extract_sender(&msg), "");
    }

    #[test]
    fn extract_sender_unicode() {
        let msg = parse("From: 张三 <zhang@example.com>\n\nbody\n");
        assert_eq!(EmailParser::default().extract_sender(&msg), "zhang@example.com");

        let msg = parse("From: =?utf-8?b?5byg5LiJ?= <zhang@example.com>\n\nbody\n");
        assert_eq!(EmailParser::default().extract_sender(&msg), "zhang@example.com");
    }

    // ── Command ─────────────────────────────────────────────────────

    #[test]
    fn extract_command_plain_text() {
        let msg = parse("From: a@example.com\nContent-Type: text/plain\n\nThis is a test command\n");
        assert_eq!(
            EmailParser::default().extract_command(&msg),
            "This is a test command"
        );
    }

    #[test]
    fn extract_command_html_only() {
        let msg = parse(
            "From: a@example.com\nContent-Type: text/html; charset=utf-8\n\n<p>run <b>backup</b></p>\n",
        );
        assert_eq!(EmailParser::default().extract_command(&msg), "run backup");
    }

    #[test]
    fn extract_command_prefers_plain_part() {
        let raw = "From: a@example.com
MIME-Version: 1.0
Content-Type: multipart/alternative; boundary=\"b1\"

--b1
Content-Type: text/plain; charset=utf-8

plain version
--b1
Content-Type: text/html; charset=utf-8

<p>html version</p>
--b1--
";
        let msg = parse(raw);
        assert_eq!(EmailParser::default().extract_command(&msg), "plain version");
    }

    #[test]
    fn extract_command_strips_reply() {
        let raw = "From: a@example.com

uptime

On Mon, Jan 5, 2026 at 9:00 AM Bot <bot@example.com> wrote:
> previous output
";
        let msg = parse(raw);
        assert_eq!(EmailParser::default().extract_command(&msg), "uptime");
    }

    // ── Full pipeline ───────────────────────────────────────────────

    #[test]
    fn parse_email_complete() {
        let parser = EmailParser::new(["test@example.com"]);
        let parsed = parser.parse_email(SAMPLE);

        assert_eq!(parsed.sender, "test@example.com");
        assert!(parsed.is_whitelisted);
        assert!(parsed.subject.contains("Test Command"));
        assert_eq!(parsed.command, "This is a test command.");
        assert_eq!(parsed.message_id.as_deref(), Some("test123@example.com"));
    }

    #[test]
    fn parse_email_not_whitelisted() {
        let parser = EmailParser::new(["someone@else.com"]);
        let parsed = parser.parse_email(SAMPLE);
        assert_eq!(parsed.sender, "test@example.com");
        assert!(!parsed.is_whitelisted);
    }

    #[test]
    fn parse_email_normalizes_sender_and_decodes_subject() {
        let raw = b"From: Ops <Ops@Example.COM>
Subject: =?utf-8?b?5rWL6K+V6YKu5Lu2?=

df -h
";
        let parsed = EmailParser::new(["ops@example.com"]).parse_email(raw);
        assert_eq!(parsed.sender, "ops@example.com");
        assert_eq!(parsed.subject, "测试邮件");
        assert!(parsed.is_whitelisted);
        assert!(parsed.message_id.is_none());
    }

    #[test]
    fn subject_with_literal_encoded_word_is_decoded_once() {
        // Decodes to the text "=?utf-8?q?x?=", which must be kept verbatim.
        let raw = b"From: ops@example.com
Subject: =?utf-8?b?PT91dGYtOD9xP3g/PQ==?=

ls
";
        let parsed = EmailParser::new(["ops@example.com"]).parse_email(raw);
        assert_eq!(parsed.subject, "=?utf-8?q?x?=");
    }

    #[test]
    fn folded_subject_is_unfolded() {
        let raw = b"From: ops@example.com\r\nSubject: Nightly\r\n backup\r\n\r\nls\r\n";
        let parsed = EmailParser::new(["ops@example.com"]).parse_email(raw);
        assert_eq!(parsed.subject, "Nightly backup");
    }

    #[test]
    fn parse_email_empty_input_degrades() {
        let parsed = EmailParser::new(["a@example.com"]).parse_email(b"");
        assert_eq!(parsed.sender, "");
        assert_eq!(parsed.subject, "");
        assert_eq!(parsed.command, "");
        assert!(!parsed.is_whitelisted);
    }

    #[test]
    fn parse_email_invalid_utf8_does_not_panic() {
        let raw = b"From: a@example.com\nSubject: \xff\xfe\n\n\xc3\x28 run\n";
        let parsed = EmailParser::default().parse_email(raw);
        assert_eq!(parsed.sender, "a@example.com");
        assert!(parsed.command.contains("run"));
    }
}
