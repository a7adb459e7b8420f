//! Status code probe
//!
//! Client-rendered apps signal soft 404s and redirects through a meta tag:
//!
//! ```html
//! <meta name="prerender-status-code" content="404">
//! ```
//!
//! `render-status-code` is accepted as well.

use once_cell::sync::Lazy;
use regex::Regex;

static STATUS_META: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta\b[^>]*\bname\s*=\s*["']?(?:prerender|render)-status-code\b[^>]*>"#)
        .expect("status meta pattern is valid")
});

static CONTENT_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bcontent\s*=\s*["']?\s*(\d{1,3})\b"#).expect("content pattern is valid")
});

/// Whether `code` is a usable HTTP status
pub fn is_valid_status(code: u16) -> bool {
    (100..=599).contains(&code)
}

/// First valid status code declared by a status meta tag
pub fn parse_status_meta(html: &str) -> Option<u16> {
    STATUS_META
        .find_iter(html)
        .filter_map(|tag| CONTENT_ATTR.captures(tag.as_str()))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u16>().ok())
        .find(|code| is_valid_status(*code))
}
