use regex::Regex;
use std::sync::LazyLock;

pub const DEFAULT_BODY_CHAR_LIMIT: usize = 25_000;

/// Reply/forward boundaries in priority order. When two patterns cut at the
/// same offset the earlier one in this list wins.
static REPLY_BOUNDARIES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // "On Mon, Jan 1, 2024 at 10:00 Bob <bob@x.com> wrote:"
        r"(?i)\bOn\s[^\n]{1,300}?\bwrote:",
        // Outlook style header block
        r"(?is)\bFrom:.{1,300}?\bSent:.{1,300}?\bTo:.{1,1000}?\bSubject:",
        r"(?im)-{2,}\s*(?:Original Message|Forwarded message)\s*-{2,}|^Begin forwarded message",
        r"(?im)<blockquote\b|^>",
        r"_{20,}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static SIGNATURE_DELIMITER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(?:--|__)[ \t]*\r?$").expect("static regex"));

static BLOCK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(?:div|p|br|li|h[1-6])\b[^>]*>").expect("static regex")
});

static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("static regex"));

static HORIZONTAL_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\x0B\x0C\u{00A0}]+").expect("static regex"));

static SPACE_AROUND_NEWLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" ?\n ?").expect("static regex"));

static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("static regex"));

#[derive(Debug, Clone, Copy)]
pub struct TextNormalizer {
    char_limit: usize,
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_BODY_CHAR_LIMIT)
    }
}

impl TextNormalizer {
    pub fn new(char_limit: usize) -> Self {
        Self { char_limit }
    }

    pub fn normalize(&self, body: &str) -> String {
        let reply = strip_quoted_reply(body);
        let text = html_to_text(reply);
        truncate_chars(&text, self.char_limit)
    }
}

/// Text before the tightest reply boundary, then before the first signature
/// delimiter line. Boundaries that would leave nothing are ignored.
pub fn strip_quoted_reply(body: &str) -> &str {
    let mut cut = body.len();
    for pattern in REPLY_BOUNDARIES.iter() {
        if let Some(m) = pattern.find(body)
            && m.start() < cut
            && !body[..m.start()].trim().is_empty()
        {
            cut = m.start();
        }
    }
    let kept = &body[..cut];

    match SIGNATURE_DELIMITER.find(kept) {
        Some(m) => &kept[..m.start()],
        None => kept,
    }
}

pub fn html_to_text(html: &str) -> String {
    let text = BLOCK_TAG.replace_all(html, "\n");
    let text = ANY_TAG.replace_all(&text, "");
    let text = decode_entities(&text);
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = HORIZONTAL_WS.replace_all(&text, " ");
    let text = SPACE_AROUND_NEWLINE.replace_all(&text, "\n");
    let text = BLANK_LINES.replace_all(&text, "\n\n");
    text.trim().to_string()
}

fn decode_entities(s: &str) -> String {
    // &amp; last so "&amp;lt;" stays "&lt;"
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
