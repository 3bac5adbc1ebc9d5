//! System endpoints: maintenance status and cache invalidation.

use axum::{
    extract::{ConnectInfo, Extension},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::AppState;

/// `GET /api/system/maintenance/status` — unauthenticated, reachable even
/// during maintenance so clients can poll for recovery.
pub async fn maintenance_status_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let config = state.config_cache.get().await.map_err(|e| {
        tracing::error!("maintenance status failed to read configuration: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(json!({
        "isMaintenanceMode": config.maintenance_mode,
        "message": config.maintenance_message,
        "startedAt": config.maintenance_started_at.map(|t| t.to_rfc3339()),
    })))
}

/// `POST /api/system/cache/invalidate` — clears the configuration cache.
///
/// Restricted to loopback callers: the administrative service runs on the
/// same host and calls this after editing the configuration row. Anything
/// else gets `403`.
pub async fn invalidate_cache_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<Value>, StatusCode> {
    if !addr.ip().is_loopback() {
        tracing::warn!(remote_addr = %addr, "cache invalidate rejected: non-loopback caller");
        return Err(StatusCode::FORBIDDEN);
    }

    state.config_cache.invalidate().await;
    Ok(Json(json!({ "status": "ok" })))
}
