//! Text sanitization for channel and item fields
//!
//! Feed titles and descriptions frequently carry markup, entities and stray
//! control characters. Everything stored in the feed state goes through
//! [`clean_text`], which produces a single trimmed line.

use regex::Regex;
use std::sync::LazyLock;

static WHITESPACE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

static SCRIPT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)\s*>").unwrap()
});

/// Reduce a possibly-HTML field to plain single-line text of at most
/// `max_chars` characters
///
/// # Examples
///
/// ```
/// use feedpull::parser::sanitize::clean_text;
///
/// let clean = clean_text("<b>Breaking</b> &amp; <i>news</i>\n\n", 100);
/// assert_eq!(clean, "Breaking & news");
/// ```
pub fn clean_text(text: &str, max_chars: usize) -> String {
    let text = strip_html_tags(text);
    let text = html_escape::decode_html_entities(&text);
    let text = remove_zero_width(&text);
    let text = remove_control_chars(&text);
    let text = normalize_whitespace(&text);
    truncate(text.trim(), max_chars)
}

/// Remove zero-width spaces and similar invisible characters
///
/// # Examples
///
/// ```
/// use feedpull::parser::sanitize::remove_zero_width;
///
/// assert_eq!(remove_zero_width("a\u{200B}b\u{FEFF}c"), "abc");
/// ```
pub fn remove_zero_width(text: &str) -> String {
    text.chars()
        .filter(|c| {
            !matches!(*c,
                '\u{200B}'..='\u{200F}' |
                '\u{2028}'..='\u{202F}' |
                '\u{FEFF}'
            )
        })
        .collect()
}

/// Replace control characters with spaces
pub fn remove_control_chars(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// Collapse every whitespace run, newlines included, to one space
pub fn normalize_whitespace(text: &str) -> String {
    WHITESPACE_REGEX.replace_all(text, " ").to_string()
}

/// Drop tags, along with the bodies of script and style elements
///
/// # Examples
///
/// ```
/// use feedpull::parser::sanitize::strip_html_tags;
///
/// let html = "<p>Hello <script>x()</script><strong>World</strong></p>";
/// assert_eq!(strip_html_tags(html), "Hello World");
/// ```
pub fn strip_html_tags(html: &str) -> String {
    let without_scripts = SCRIPT_REGEX.replace_all(html, "");
    TAG_REGEX.replace_all(&without_scripts, "").to_string()
}

/// Truncate text to max length with ellipsis
pub fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
