//! Request domain extraction and normalisation
//!
//! The server-observed domain is authoritative for every binding decision;
//! it is read from the Origin header (Referer as fallback) and never from
//! the request body.

use axum::http::HeaderMap;

/// Normalises a hostname for comparison: lowercase, trailing dots and any
/// port stripped.
pub fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim().to_ascii_lowercase();
    let domain = domain.trim_end_matches('.');

    // Bracketed IPv6 hosts keep their brackets; everything after the last
    // colon outside brackets is a port.
    if let Some(stripped) = domain.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            return format!("[{}]", &stripped[..end]);
        }
    }
    match domain.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => domain.to_string(),
    }
}

/// Extracts the host portion of an Origin/Referer-style URL.
fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host = rest.split(['/', '?', '#']).next()?;
    if host.is_empty() {
        return None;
    }
    Some(normalize_domain(host))
}

/// Returns the domain the request claims to originate from, preferring
/// Origin over Referer. `None` when neither header parses.
pub fn extract_request_domain(headers: &HeaderMap) -> Option<String> {
    if let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) {
        if origin != "null" {
            if let Some(host) = host_of(origin) {
                return Some(host);
            }
        }
    }
    headers
        .get("referer")
        .and_then(|v| v.to_str().ok())
        .and_then(host_of)
}

/// Returns the country code reported by the edge, if any.
pub fn extract_country(headers: &HeaderMap) -> Option<String> {
    headers
        .get("cf-ipcountry")
        .and_then(|v| v.to_str().ok())
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| c.len() == 2 && c != "XX")
}
