use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

use crate::key_generator;
use crate::limiter::DecisionSource;
use crate::response;
use crate::rules::MissingKeyPolicy;
use crate::server::AppState;

/// Stamps every request/response pair with an `x-request-id` and logs it.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = key_generator::client_ip(request.headers(), peer_addr(&request));

    if let Ok(value) = HeaderValue::from_str(&id) {
        request.headers_mut().insert("x-request-id", value);
    }

    info!(
        target: "iota_limiter::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        request_id = %id,
        "incoming request"
    );

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }

    info!(
        target: "iota_limiter::middleware",
        method = %method,
        uri = %uri,
        status = %response.status(),
        request_id = %id,
        "request completed"
    );

    response
}

/// Rate limit enforcement.
///
/// Exempt paths and unmatched requests pass through untouched. Everything
/// else is decided by the limiter; allowed requests are forwarded with
/// `X-RateLimit-*` headers, denied ones answered on the spot.
pub async fn enforce(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    if state.settings.is_exempt(&path) {
        return next.run(request).await;
    }

    let method = request.method().as_str().to_string();
    let rule = {
        let rules = state.rules.read().await;
        rules.resolve(&method, &path).cloned()
    };
    let Some(rule) = rule else {
        return next.run(request).await;
    };

    let key = key_generator::extract(rule.key, request.headers(), peer_addr(&request));
    let Some(key) = key else {
        return match rule.on_missing_key {
            MissingKeyPolicy::Allow => next.run(request).await,
            MissingKeyPolicy::Deny => {
                state
                    .metrics
                    .missing_key_denied_total
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                response::missing_key(&rule.id, rule.key)
            }
        };
    };

    let decision = state.limiter.decide(&rule, &key).await;
    state.metrics.record_outcome(&rule.id, decision.allowed).await;
    if decision.degraded() {
        state.metrics.record_fallback(decision.source);
    }

    if !decision.allowed {
        return match decision.source {
            DecisionSource::FailClosed => {
                response::service_unavailable(decision.retry_after.unwrap_or(1))
            }
            _ => response::too_many_requests(&decision),
        };
    }

    let mut response = next.run(request).await;
    response::apply_rate_limit_headers(response.headers_mut(), &decision);
    response
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
}
