use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::signal;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::config_validator::ConfigValidator;
use crate::error::Result;
use crate::handlers;
use crate::health::HealthChecker;
use crate::limiter::RateLimiter;
use crate::metrics::Metrics;
use crate::middleware::{enforce, request_id};
use crate::redis::{RedisHandle, RedisPolicy};
use crate::rules::{default_rule, RuleSet};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub rules: Arc<RwLock<RuleSet>>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    pub health: Arc<HealthChecker>,
    pub redis: RedisHandle,
}

/// Validate settings, load rules and wire up the shared state.
pub fn build_state(settings: Settings) -> Result<AppState> {
    ConfigValidator::validate_settings(&settings)?;

    let redis = RedisHandle::connect(&settings.redis_url, RedisPolicy::from_settings(&settings))?;
    let fallback_default = default_rule(settings.default_limit, settings.default_window);
    let rule_set = match &settings.rules_file {
        Some(path) => RuleSet::from_file(path, fallback_default)?,
        None => RuleSet::new(fallback_default),
    };
    ConfigValidator::validate_rule_set(&rule_set)?;

    let limiter = RateLimiter::new(redis.clone(), &settings.key_prefix, settings.fail_policy);
    let health = HealthChecker::new(redis.clone());

    Ok(AppState {
        settings: Arc::new(settings),
        rules: Arc::new(RwLock::new(rule_set)),
        limiter: Arc::new(limiter),
        metrics: Arc::new(Metrics::new()),
        health: Arc::new(health),
        redis,
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/limits", get(handlers::list_rules))
        .route(
            "/limits/:id",
            get(handlers::get_rule)
                .put(handlers::put_rule)
                .delete(handlers::delete_rule),
        )
        .route("/limits/:id/reset", post(handlers::reset_rule))
        .route("/check", post(handlers::check))
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics))
        .with_state(state.clone())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(axum::middleware::from_fn(request_id))
                .layer(axum::middleware::from_fn_with_state(state, enforce)),
        )
}

pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(settings: Settings) -> Result<Self> {
        Ok(Self {
            state: build_state(settings)?,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run(self) -> Result<()> {
        let bind = self.state.settings.bind_addr;
        let app = build_router(self.state);
        let listener = tokio::net::TcpListener::bind(bind).await?;

        tracing::info!(%bind, "iota-limiter listening");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            tracing::info!("received terminate signal, shutting down");
        },
    }
}
