//! Helpers for sanitizing data before it enters logs and span fields.
//!
//! Presigned download URLs carry signatures in their query string and
//! worker error bodies can be arbitrarily large.

/// Maximum length for error bodies copied into logs or failure reasons.
pub const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Strips the query string, fragment, and userinfo from a URL.
///
/// - `https://bucket.s3/key.pdf?X-Amz-Signature=abc` → `https://bucket.s3/key.pdf?<redacted>`
/// - `https://user:pw@host/path` → `https://****@host/path`
/// - `https://host/path` → `https://host/path` (no change)
pub fn redact_url(url: &str) -> String {
    let (base, had_query) = match url.find(['?', '#']) {
        Some(pos) => (&url[..pos], true),
        None => (url, false),
    };

    let base = match base.find("://") {
        Some(scheme_end) => {
            let after_scheme = &base[scheme_end + 3..];
            let authority_end = after_scheme.find('/').unwrap_or(after_scheme.len());
            match after_scheme[..authority_end].rfind('@') {
                Some(at_pos) => format!(
                    "{}****@{}",
                    &base[..scheme_end + 3],
                    &after_scheme[at_pos + 1..]
                ),
                None => base.to_string(),
            }
        }
        None => base.to_string(),
    };

    if had_query {
        format!("{}?<redacted>", base)
    } else {
        base
    }
}

/// Truncates `body` to `MAX_ERROR_BODY_LENGTH` bytes on a char boundary.
pub fn truncate_for_log(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &body[..end])
}
