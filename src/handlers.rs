use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::config::FailurePolicy;
use crate::error::{Error, Result};
use crate::key_generator;
use crate::response::apply_rate_limit_headers;
use crate::rules::{Rule, RuleSet};
use crate::server::AppState;

/// List all rules plus the default.
pub async fn list_rules(State(state): State<AppState>) -> Json<RuleSet> {
    Json(state.rules.read().await.clone())
}

pub async fn get_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Rule>> {
    let rules = state.rules.read().await;
    rules
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(Error::RuleNotFound(id))
}

/// Create or replace a rule. The id in the path wins over any id in the body.
pub async fn put_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut rule): Json<Rule>,
) -> Result<Json<Rule>> {
    rule.id = id;
    rule.normalize();
    rule.validate_full()?;

    let mut rules = state.rules.write().await;
    rules.upsert(rule.clone());
    tracing::info!(rule = %rule.id, limit = rule.limit, "rule updated");
    Ok(Json(rule))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    if id == "default" {
        return Err(Error::Validation(
            "the default rule cannot be removed; disable it instead".to_string(),
        ));
    }
    let mut rules = state.rules.write().await;
    match rules.remove(&id) {
        Some(removed) => {
            tracing::info!(rule = %removed.id, "rule removed");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(Error::RuleNotFound(id)),
    }
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub key: String,
}

/// Clear the current window counter for a (rule, key) pair.
pub async fn reset_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResetRequest>,
) -> Result<Json<serde_json::Value>> {
    let rule = {
        let rules = state.rules.read().await;
        rules.get(&id).cloned()
    }
    .ok_or_else(|| Error::RuleNotFound(id.clone()))?;

    let key = key_generator::sanitize(&req.key);
    let cleared = state.limiter.reset(&rule, &key).await?;
    Ok(Json(serde_json::json!({
        "rule": rule.id,
        "key": key,
        "cleared": cleared,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub key: String,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Run a decision for an arbitrary (path, method, key) triple.
///
/// This counts against the window like any real request would.
pub async fn check(
    State(state): State<AppState>,
    Json(req): Json<CheckRequest>,
) -> Result<Response> {
    let rule = {
        let rules = state.rules.read().await;
        rules.resolve(&req.method, &req.path).cloned()
    }
    .ok_or_else(|| Error::RuleNotFound(format!("no rule matches {} {}", req.method, req.path)))?;

    let key = key_generator::sanitize(&req.key);
    let decision = state.limiter.decide(&rule, &key).await;

    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    let mut response = (status, Json(&decision)).into_response();
    apply_rate_limit_headers(response.headers_mut(), &decision);
    Ok(response)
}

pub async fn health(State(state): State<AppState>) -> Response {
    Json(state.health.check().await).into_response()
}

pub async fn ready(State(state): State<AppState>) -> Response {
    if state.settings.fail_policy == FailurePolicy::Closed && !state.health.redis_ok().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "redis": "unreachable",
            })),
        )
            .into_response();
    }
    Json(serde_json::json!({ "status": "ready" })).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    let body = state.metrics.render(&state.redis.counters).await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
