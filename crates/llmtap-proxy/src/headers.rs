//! Header filtering and redaction policy

use std::collections::HashMap;

/// Hop-by-hop headers, never forwarded in either direction. `host` and
/// `content-length` are regenerated by the HTTP client.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Stripped from forwarded requests so the upstream client negotiates its
/// own encoding and hands us decoded bytes.
const STRIP_REQUEST_HEADERS: &[&str] = &["accept-encoding"];

/// Stale after the client has decoded the body; stripped from responses.
const STRIP_RESPONSE_HEADERS: &[&str] = &["content-encoding", "content-length", "transfer-encoding"];

/// Header names whose values carry API credentials.
const SENSITIVE_HEADERS: &[&str] = &["authorization", "x-api-key", "api-key", "openai-api-key"];

pub fn is_excluded_request_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .chain(STRIP_REQUEST_HEADERS)
        .any(|h| name.eq_ignore_ascii_case(h))
}

pub fn is_excluded_response_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .chain(STRIP_RESPONSE_HEADERS)
        .any(|h| name.eq_ignore_ascii_case(h))
}

/// Redact sensitive header values before storage: keep the first 12 chars
/// and mask the rest; short values are masked entirely.
pub fn redact_headers(
    headers: &HashMap<String, String>,
    redact: bool,
) -> HashMap<String, String> {
    if !redact {
        return headers.clone();
    }
    headers
        .iter()
        .map(|(name, value)| {
            if SENSITIVE_HEADERS.iter().any(|s| name.eq_ignore_ascii_case(s)) {
                (name.clone(), redact_value(value))
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

fn redact_value(value: &str) -> String {
    if value.chars().count() > 12 {
        let prefix: String = value.chars().take(12).collect();
        format!("{prefix}***")
    } else {
        "***".to_string()
    }
}
