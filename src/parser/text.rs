//! Text helpers for turning mail bodies and headers into command text.

use std::sync::LazyLock;

use mail_parser::MessageParser;
use regex::{Captures, Regex};

static SCRIPT_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:script|style)\b[^>]*>.*?</(?:script|style)\s*>").unwrap()
});
static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static LINE_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)<br\s*/?>|</?(?:p|div|h[1-6]|li|ul|ol|tr|table|blockquote|pre|section|article|header|footer)\b[^>]*>",
    )
    .unwrap()
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z]+);").unwrap());

/// Address part of a `From`-style header value.
///
/// `Name <addr>` yields `addr`, a bare address comes back trimmed, and an
/// empty value yields `""`.
pub fn sender_address(header: &str) -> String {
    let header = header.trim();
    match header.rfind('<') {
        Some(start) => {
            let rest = &header[start + 1..];
            let end = rest.find('>').unwrap_or(rest.len());
            rest[..end].trim().to_string()
        }
        None => header.to_string(),
    }
}

/// Decode RFC 2047 encoded words. Undecodable input is returned as is.
pub fn decode_header(value: &str) -> String {
    if !value.contains("=?") {
        return value.to_string();
    }

    let flat = value.replace(['\r', '\n'], " ");
    let raw = format!("Subject: {flat}\r\n\r\n");
    MessageParser::default()
        .parse(raw.as_bytes())
        .and_then(|msg| msg.subject().map(str::to_string))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| value.to_string())
}

/// Convert an HTML body to readable plain text.
pub fn html_to_text(html: &str) -> String {
    let text = SCRIPT_STYLE.replace_all(html, "");
    let text = COMMENT.replace_all(&text, "");
    let text = LINE_BREAK.replace_all(&text, "\n");
    let text = TAG.replace_all(&text, "");
    let text = ENTITY.replace_all(&text, |caps: &Captures| decode_entity(&caps[0], &caps[1]));

    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        // Collapse runs of blank lines to one.
        if line.is_empty() && lines.last().is_none_or(|l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

fn decode_entity(whole: &str, name: &str) -> String {
    let decoded = if let Some(num) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
        u32::from_str_radix(num, 16).ok().and_then(char::from_u32)
    } else if let Some(num) = name.strip_prefix('#') {
        num.parse::<u32>().ok().and_then(char::from_u32)
    } else {
        match name {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            "copy" => Some('©'),
            "reg" => Some('®'),
            "hellip" => Some('…'),
            "mdash" => Some('—'),
            "ndash" => Some('–'),
            _ => None,
        }
    };
    decoded.map_or_else(|| whole.to_string(), String::from)
}

/// Remove quoted lines and everything from the first reply separator on.
pub fn strip_replies(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut result = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }
        if is_separator(trimmed) || is_header_block(&lines[i..]) {
            break;
        }

        result.push(*line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}

/// Single-line reply attributions and separators.
fn is_separator(line: &str) -> bool {
    // "On Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:"
    if line.starts_with("On ") && line.ends_with("wrote:") {
        return true;
    }
    // "-----Original Message-----"
    if line.starts_with("---") && line.contains("Original Message") {
        return true;
    }
    // "在 2026年1月1日 张三 <zhang@example.com> 写道："
    line.starts_with('在') && (line.ends_with("写道：") || line.ends_with("写道:"))
}

/// A `From:` line followed closely by other message headers.
fn is_header_block(lines: &[&str]) -> bool {
    let Some(first) = lines.first() else {
        return false;
    };
    if !first.trim_start().starts_with("From:") {
        return false;
    }
    lines.iter().skip(1).take(3).any(|l| {
        let l = l.trim_start();
        ["Sent:", "Date:", "To:", "Subject:", "Cc:"]
            .iter()
            .any(|h| l.starts_with(h))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── sender_address ──────────────────────────────────────────────

    #[test]
    fn sender_with_display_name() {
        assert_eq!(sender_address("John Doe <john@example.com>"), "john@example.com");
    }

    #[test]
    fn sender_bare_address() {
        assert_eq!(sender_address("user@example.com"), "user@example.com");
        assert_eq!(sender_address("  user@example.com "), "user@example.com");
    }

    #[test]
    fn sender_empty() {
        assert_eq!(sender_address(""), "");
        assert_eq!(sender_address("   "), "");
    }

    #[test]
    fn sender_unicode_display_name() {
        assert_eq!(sender_address("张三 <zhang@example.com>"), "zhang@example.com");
    }

    #[test]
    fn sender_unterminated_bracket() {
        assert_eq!(sender_address("Broken <broken@example.com"), "broken@example.com");
    }

    // ── decode_header ───────────────────────────────────────────────

    #[test]
    fn decode_plain_passthrough() {
        assert_eq!(decode_header("Test Command"), "Test Command");
    }

    #[test]
    fn decode_utf8_base64() {
        assert_eq!(decode_header("=?utf-8?b?5rWL6K+V6YKu5Lu2?="), "测试邮件");
    }

    #[test]
    fn decode_quoted_printable() {
        assert_eq!(decode_header("=?ISO-8859-1?Q?Caf=E9?="), "Café");
    }

    // ── html_to_text ────────────────────────────────────────────────

    #[test]
    fn html_basic() {
        let html = "<html><body><h1>Title</h1><p>This is a paragraph</p></body></html>";
        let text = html_to_text(html);
        assert!(!text.contains("<h1>"));
        assert!(!text.contains("<html>"));
        assert_eq!(text, "Title\n\nThis is a paragraph");
    }

    #[test]
    fn html_drops_script_and_style() {
        let html = "<style>p { color: red; }</style><p>run backup</p><script>alert(1)</script>";
        assert_eq!(html_to_text(html), "run backup");
    }

    #[test]
    fn html_line_breaks_and_entities() {
        let html = "ls -la<br>echo &quot;a &amp; b&quot;<br/>x &lt; y &#38; &#x41;";
        assert_eq!(html_to_text(html), "ls -la\necho \"a & b\"\nx < y & A");
    }

    #[test]
    fn html_unknown_entity_kept() {
        assert_eq!(html_to_text("a &bogus; b"), "a &bogus; b");
    }

    #[test]
    fn html_collapses_blank_runs() {
        let html = "<p>one</p>\n\n\n<p>two</p>";
        assert_eq!(html_to_text(html), "one\n\ntwo");
    }

    #[test]
    fn html_malformed_does_not_panic() {
        html_to_text("<div <p>>>< &#99999999; &#xZZ; <");
        assert_eq!(html_to_text(""), "");
    }

    // ── strip_replies ───────────────────────────────────────────────

    #[test]
    fn strip_quoted_lines() {
        let text = "This is my command\n\n> This is a quote\n> from the previous email\n> more quotes";
        let result = strip_replies(text);
        assert!(!result.contains('>'));
        assert_eq!(result, "This is my command");
    }

    #[test]
    fn strip_on_wrote_attribution() {
        let text = "This is my command\n\nOn someone@example.com wrote:\nPrevious message here";
        assert_eq!(strip_replies(text), "This is my command");
    }

    #[test]
    fn strip_original_message_separator() {
        let text = "git pull\n-----Original Message-----\nFrom: bob\nold stuff";
        assert_eq!(strip_replies(text), "git pull");
    }

    #[test]
    fn strip_outlook_header_block() {
        let text = "restart nginx\n\nFrom: Ops <ops@example.com>\nSent: Monday\nTo: me\n\nearlier";
        assert_eq!(strip_replies(text), "restart nginx");
    }

    #[test]
    fn lone_from_line_is_content() {
        let text = "From: the top, please\nrun it again";
        assert_eq!(strip_replies(text), text);
    }

    #[test]
    fn strip_cjk_attribution() {
        let text = "查看日志\n在 2026年1月1日 张三 <zhang@example.com> 写道：\n旧内容";
        assert_eq!(strip_replies(text), "查看日志");
    }

    #[test]
    fn keeps_new_content_verbatim() {
        let text = "  line one  \n\tline two\n";
        assert_eq!(strip_replies(text), "  line one  \n\tline two");
    }

    #[test]
    fn strip_empty_input() {
        assert_eq!(strip_replies(""), "");
    }
}
