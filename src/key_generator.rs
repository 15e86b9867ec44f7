//! Client key extraction for rate limiting.

use std::net::SocketAddr;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Where the client key for a rule comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeySource {
    /// Client IP address.
    #[default]
    Ip,
    /// `x-api-key` header, falling back to `authorization`.
    ApiKey,
    /// `x-user-id` header.
    UserId,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Ip => write!(f, "ip"),
            KeySource::ApiKey => write!(f, "api-key"),
            KeySource::UserId => write!(f, "user-id"),
        }
    }
}

/// Keys longer than this are truncated before reaching Redis.
pub const MAX_KEY_BYTES: usize = 128;

/// Resolve the client IP, preferring proxy headers over the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real_ip.to_string();
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Extract the rate-limit key for a request, already sanitized.
///
/// Returns `None` when the source header is absent; the caller applies the
/// rule's missing-key policy.
pub fn extract(source: KeySource, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let raw = match source {
        KeySource::Ip => Some(client_ip(headers, peer)),
        KeySource::ApiKey => headers
            .get("x-api-key")
            .or_else(|| headers.get("authorization"))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        KeySource::UserId => headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };
    raw.map(|k| sanitize(&k))
}

/// Restrict a key to a Redis-safe charset and bounded length.
pub fn sanitize(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .take(MAX_KEY_BYTES)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}
