//! Aria server library logic.

pub mod api_relay;
pub mod api_system;
pub mod config;
pub mod config_cache;
pub mod middleware;

use std::sync::Arc;
use std::time::Duration;

use aria_db::DbPool;
use aria_provider::HttpSpeechProvider;
use aria_slots::SlotManager;
use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use config_cache::ConfigCache;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

/// Relay runtime tunables, fixed at startup.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Per-receive idle timeout on either relay leg.
    pub idle_timeout: Duration,

    /// Minimum wall-clock interval between in-flight quota checks.
    pub check_interval: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(90),
            check_interval: Duration::from_secs(5),
        }
    }
}

impl RelaySettings {
    pub fn from_config(relay: &config::RelayConfig) -> Self {
        Self {
            idle_timeout: Duration::from_secs(relay.idle_timeout_secs),
            check_interval: Duration::from_secs(relay.check_interval_secs),
        }
    }
}

/// Application state shared across all request handlers.
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Read-through cache over the active safety configuration.
    pub config_cache: ConfigCache,
    /// Speech-provider client (HTTP voice management + WebSocket dialer).
    pub provider: Arc<HttpSpeechProvider>,
    /// Voice slot manager.
    pub slots: SlotManager,
    /// Relay tunables.
    pub relay: RelaySettings,
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/system/maintenance/status",
            get(api_system::maintenance_status_handler),
        )
        .route(
            "/api/system/cache/invalidate",
            post(api_system::invalidate_cache_handler),
        )
        .route(
            "/ws/conversations/{conversationId}",
            get(api_relay::relay_handler),
        )
        .layer(axum::middleware::from_fn(middleware::maintenance_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
