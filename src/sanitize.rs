use once_cell::sync::Lazy;
use regex::Regex;

pub const MAX_MESSAGE_CHARS: usize = 5000;
pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_DESCRIPTION_CHARS: usize = 5000;

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("html tag regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizePolicy {
    Message,
    Title,
    Description,
}

impl SanitizePolicy {
    pub fn max_chars(self) -> usize {
        match self {
            SanitizePolicy::Message => MAX_MESSAGE_CHARS,
            SanitizePolicy::Title => MAX_TITLE_CHARS,
            SanitizePolicy::Description => MAX_DESCRIPTION_CHARS,
        }
    }

    pub fn apply(self, text: &str) -> String {
        sanitize_text(text, self.max_chars())
    }
}

/// Trims, drops control characters other than newline and tab, and caps the
/// result at `max_chars` characters.
pub fn sanitize_text(text: &str, max_chars: usize) -> String {
    text.trim()
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .take(max_chars)
        .collect()
}

pub fn strip_html(html: &str) -> String {
    HTML_TAG.replace_all(html, "").into_owned()
}
