//! Aria server binary — brokers real-time audio between mobile clients and
//! the speech provider.
//!
//! Starts an axum HTTP/WebSocket server with structured logging, database
//! initialization, a fatal check for the active safety configuration, and
//! graceful shutdown on SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aria_provider::{HttpSpeechProvider, ProviderConfig};
use aria_server::{app, config, config_cache::ConfigCache, AppState, RelaySettings};
use aria_slots::SlotManager;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("ARIA_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration — the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize database
    let pool = aria_db::create_pool(
        &config.database.path,
        aria_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool — check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = aria_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }

        // Fresh-install seeding, opt-in only. A missing configuration is
        // otherwise fatal below.
        if std::env::var("ARIA_SEED_DEFAULT_CONFIG").as_deref() == Ok("1") {
            aria_db::seed_default_config(&conn)
                .expect("failed to seed default safety configuration");
        }
    }

    // The safety configuration row must exist before serving anything.
    let config_cache = ConfigCache::new(
        pool.clone(),
        Duration::from_secs(config.relay.config_ttl_secs),
    );
    config_cache.get().await.expect(
        "no active system safety configuration — create one via the admin service \
         or set ARIA_SEED_DEFAULT_CONFIG=1 for a fresh install",
    );

    if config.provider.api_key.is_empty() {
        tracing::warn!("provider.api_key is empty — provider calls will be rejected upstream");
    }

    let provider = Arc::new(HttpSpeechProvider::new(ProviderConfig {
        api_key: config.provider.api_key.clone(),
        base_url: config.provider.base_url.clone(),
        ws_base_url: config.provider.ws_base_url.clone(),
    }));
    let slots = SlotManager::new(pool.clone(), provider.clone());

    // Build application
    let state = AppState {
        pool,
        config_cache,
        provider,
        slots,
        relay: RelaySettings::from_config(&config.relay),
    };
    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting aria server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address — is another process using this port?");

    // Serve with graceful shutdown. ConnectInfo is required by the
    // loopback-only cache-invalidate endpoint.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    tracing::info!("aria server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
