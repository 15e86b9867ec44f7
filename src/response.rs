//! Rate limit response headers and rejection bodies.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::key_generator::KeySource;
use crate::limiter::Decision;

#[derive(Debug, Serialize)]
pub struct RejectionBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Attach `X-RateLimit-*` headers when the decision carries real counts.
/// Fail-open and fail-closed decisions carry none.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    let (Some(remaining), Some(reset_at)) = (decision.remaining, decision.reset_at) else {
        return;
    };
    headers.insert(
        HeaderName::from_static("x-ratelimit-limit"),
        HeaderValue::from(decision.limit),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-remaining"),
        HeaderValue::from(remaining),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-reset"),
        HeaderValue::from(reset_at),
    );
}

pub fn too_many_requests(decision: &Decision) -> Response {
    let retry_after = decision.retry_after.unwrap_or(1);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(RejectionBody {
            error: "rate_limit_exceeded",
            message: "request rate limit exceeded".to_string(),
            retry_after: Some(retry_after),
        }),
    )
        .into_response();
    apply_rate_limit_headers(response.headers_mut(), decision);
    response.headers_mut().insert(
        HeaderName::from_static("retry-after"),
        HeaderValue::from(retry_after),
    );
    response
}

pub fn service_unavailable(retry_after: u64) -> Response {
    let mut response = (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(RejectionBody {
            error: "upstream_unavailable",
            message: "rate limit backend unavailable".to_string(),
            retry_after: Some(retry_after),
        }),
    )
        .into_response();
    response.headers_mut().insert(
        HeaderName::from_static("retry-after"),
        HeaderValue::from(retry_after),
    );
    response
}

pub fn missing_key(rule_id: &str, source: KeySource) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(RejectionBody {
            error: "missing_client_key",
            message: format!("rule '{rule_id}' requires a {source} key"),
            retry_after: None,
        }),
    )
        .into_response()
}
