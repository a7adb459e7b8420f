//! Cache key derivation
//!
//! A key is the full URL including its query string, minus the render
//! control parameters, so preview/debug requests and organic crawler
//! requests for the same resource share one entry.

use url::Url;

use crate::gate::RENDER_PARAMS;

/// Derive the cache key for a URL
///
/// - `render` / `_render` query parameters are removed
/// - all other parameters keep their original order and encoding
/// - an empty query and the fragment are dropped
/// - unparseable input is returned trimmed
pub fn derive_key(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    url.set_fragment(None);

    if let Some(query) = url.query().map(str::to_owned) {
        let kept: Vec<&str> = query
            .split('&')
            .filter(|pair| !pair.is_empty() && !is_render_param(pair))
            .collect();

        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&kept.join("&")));
        }
    }

    url.to_string()
}

fn is_render_param(pair: &str) -> bool {
    url::form_urlencoded::parse(pair.as_bytes())
        .next()
        .map(|(name, _)| RENDER_PARAMS.contains(&&*name))
        .unwrap_or(false)
}
