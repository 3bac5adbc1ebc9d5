//! Request-level gates: maintenance mode and bearer-token authentication.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

/// An authenticated relay user.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub id: String,
}

/// Paths that stay reachable while maintenance mode is on: the health
/// probe, the maintenance status endpoint itself, and the administrative
/// cache-invalidate hook (the admin service needs it to end maintenance).
const MAINTENANCE_EXEMPT_PATHS: &[&str] = &[
    "/health",
    "/api/system/maintenance/status",
    "/api/system/cache/invalidate",
];

/// Short-circuits every client-facing request with `503` while the cached
/// configuration has maintenance mode set.
///
/// Reads through the same [`crate::config_cache::ConfigCache`] as the
/// quota checks, so a maintenance toggle becomes visible within the same
/// TTL window everywhere.
pub async fn maintenance_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    if MAINTENANCE_EXEMPT_PATHS.contains(&req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let config = state.config_cache.get().await.map_err(|e| {
        tracing::error!("maintenance gate failed to read configuration: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    if config.maintenance_mode {
        let body = json!({
            "error": "maintenance",
            "message": config
                .maintenance_message
                .as_deref()
                .unwrap_or("The service is temporarily down for maintenance."),
            "startedAt": config.maintenance_started_at.map(|t: DateTime<Utc>| t.to_rfc3339()),
        });
        return Ok((StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response());
    }

    Ok(next.run(req).await)
}

/// Resolves a bearer token to an active user.
///
/// Invalid, unknown, inactive, and soft-deleted all collapse to
/// `UNAUTHORIZED`; the relay leaks nothing about which it was.
pub async fn authenticate_token(
    state: &Arc<AppState>,
    token: &str,
) -> Result<AuthedUser, StatusCode> {
    let pool = state.pool.clone();
    let token = token.to_string();
    let result = tokio::task::spawn_blocking(move || -> Result<Option<(String, bool)>, String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.query_row(
            "SELECT id, active FROM users WHERE auth_token = ?1 AND deleted_at IS NULL",
            [token],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| e.to_string())
    })
    .await;

    match result {
        Ok(Ok(Some((id, true)))) => Ok(AuthedUser { id }),
        Ok(Ok(Some((_, false)))) | Ok(Ok(None)) => Err(StatusCode::UNAUTHORIZED),
        Ok(Err(e)) => {
            tracing::error!("token lookup failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(e) => {
            tracing::error!("token lookup task failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
