//! URL utilities for the decision path
//!
//! Every cache, block and allow lookup is keyed by the normalized URL, so
//! two URLs that differ only by fragment or credentials share one entry.

use ::url::Url;

/// URL prefixes the engine never touches.
const RESTRICTED_PREFIXES: [&str; 3] = ["chrome://", "devtools://", "chrome-extension://"];

// =============================================================================
// Normalization
// =============================================================================

/// Canonicalize a URL to `origin + path + query`.
///
/// Fragment and userinfo are dropped, as is an empty query. Input that does
/// not parse is returned unchanged.
pub fn normalize_url(url: &str) -> String {
    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(_) => return url.to_string(),
    };

    let mut out = parsed.origin().ascii_serialization();
    out.push_str(parsed.path());
    if let Some(query) = parsed.query().filter(|q| !q.is_empty()) {
        out.push('?');
        out.push_str(query);
    }
    out
}

// =============================================================================
// Filters
// =============================================================================

/// Browser-internal pages the engine must not score or redirect.
#[inline]
pub fn is_restricted_url(url: &str) -> bool {
    RESTRICTED_PREFIXES.iter().any(|p| url.starts_with(p))
}

/// Pages served by the extension itself (interstitials, popup).
#[inline]
pub fn is_extension_url(url: &str, extension_base: &str) -> bool {
    !extension_base.is_empty() && url.starts_with(extension_base)
}

/// Top-level web navigations (`http` / `https`).
#[inline]
pub fn is_web_url(url: &str) -> bool {
    url.starts_with("http")
}

/// Top-level navigations the engine takes a decision on.
pub fn should_intercept(url: &str, extension_base: &str) -> bool {
    !url.is_empty()
        && is_web_url(url)
        && !is_restricted_url(url)
        && !is_extension_url(url, extension_base)
}

// =============================================================================
// Rule Conditions
// =============================================================================

/// Escape regex metacharacters so `s` matches literally.
pub fn escape_regex(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        if matches!(
            c,
            '.' | '*' | '+' | '?' | '^' | '$' | '{' | '}' | '(' | ')' | '|' | '[' | ']' | '\\'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Anchored exact-match condition for a normalized URL.
pub fn exact_match_regex(url: &str) -> String {
    format!("^{}$", escape_regex(url))
}

// =============================================================================
// Interstitial
// =============================================================================

/// Build the warning page URL carrying the target URL and its score.
pub fn build_warning_url(extension_base: &str, url: &str, score: u8) -> String {
    let query = ::url::form_urlencoded::Serializer::new(String::new())
        .append_pair("url", url)
        .append_pair("score", &score.to_string())
        .finish();
    format!("{}warning.html?{}", extension_base, query)
}
