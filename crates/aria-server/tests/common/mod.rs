#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aria_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use aria_provider::{HttpSpeechProvider, ProviderConfig};
use aria_server::{app, config_cache::ConfigCache, AppState, RelaySettings};
use aria_slots::SlotManager;
use futures_util::{SinkExt, StreamExt};
use rusqlite::params;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

pub struct TestHarness {
    pub addr: SocketAddr,
    pub pool: DbPool,
    pub cache: ConfigCache,
    _tmp: TempDir,
}

/// Creates a file-backed pool, runs migrations, and seeds the default
/// safety configuration plus one user / identity / conversation.
pub fn seeded_pool() -> (TempDir, DbPool) {
    let tmp = TempDir::new().expect("tempdir");
    let db_path = tmp.path().join("aria-test.db");
    let pool = create_pool(db_path.to_str().unwrap(), DbRuntimeSettings::default())
        .expect("pool creation should succeed");
    {
        let conn = pool.get().expect("connection");
        run_migrations(&conn).expect("migrations");
        aria_db::seed_default_config(&conn).expect("seed config");
        conn.execute(
            "INSERT INTO users (id, auth_token) VALUES ('u1', 'tok-1')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO ai_identities (id, user_id, name) VALUES ('i1', 'u1', 'Iris')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO conversations (id, user_id, identity_id) VALUES ('c1', 'u1', 'i1')",
            [],
        )
        .unwrap();
    }
    (tmp, pool)
}

/// Gives the conversation's identity an active voice slot so the relay
/// takes the fast path and never calls the provider HTTP API.
pub fn add_active_slot(pool: &DbPool, identity_id: &str, voice_id: &str) {
    let conn = pool.get().unwrap();
    conn.execute(
        "INSERT INTO voice_slots (identity_id, provider_voice_id, last_used_at, active)
         VALUES (?1, ?2, ?3, 1)",
        params![identity_id, voice_id, chrono::Utc::now().to_rfc3339()],
    )
    .unwrap();
}

pub fn update_config(pool: &DbPool, set_clause: &str) {
    let conn = pool.get().unwrap();
    conn.execute(
        &format!("UPDATE system_safety_config SET {set_clause} WHERE is_active = 1"),
        [],
    )
    .unwrap();
}

/// Serves the application on an ephemeral port against a fake provider
/// WebSocket endpoint. Relay timeouts are shortened so tests stay fast.
pub async fn spawn_app(provider_ws_base: &str) -> TestHarness {
    spawn_app_with_idle(provider_ws_base, Duration::from_secs(5)).await
}

/// Same as [`spawn_app`] with a caller-chosen idle timeout, for tests
/// that drive the timeout path itself.
pub async fn spawn_app_with_idle(provider_ws_base: &str, idle_timeout: Duration) -> TestHarness {
    let (tmp, pool) = seeded_pool();

    let cache = ConfigCache::new(pool.clone(), Duration::from_secs(300));
    let provider = Arc::new(HttpSpeechProvider::new(ProviderConfig {
        api_key: "test-key".to_string(),
        base_url: "http://127.0.0.1:1".to_string(),
        ws_base_url: provider_ws_base.to_string(),
    }));
    let slots = SlotManager::new(pool.clone(), provider.clone());

    let state = AppState {
        pool: pool.clone(),
        config_cache: cache.clone(),
        provider,
        slots,
        relay: RelaySettings {
            idle_timeout,
            check_interval: Duration::from_millis(50),
        },
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("test server error");
    });

    TestHarness {
        addr,
        pool,
        cache,
        _tmp: tmp,
    }
}

/// A fake provider voice-stream server that echoes binary frames back.
pub async fn spawn_echo_provider() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(echo_session(stream));
        }
    });
    format!("ws://{addr}")
}

async fn echo_session(stream: TcpStream) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    while let Some(Ok(msg)) = ws.next().await {
        match msg {
            Message::Binary(data) => {
                if ws.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// A fake provider that accepts the stream and then goes quiet: it reads
/// frames forever and never sends or closes.
pub async fn spawn_silent_provider() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                    while let Some(Ok(_)) = ws.next().await {}
                }
            });
        }
    });
    format!("ws://{addr}")
}

/// A fake provider that accepts the stream and immediately closes it.
pub async fn spawn_closing_provider() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                    let _ = ws.close(None).await;
                }
            });
        }
    });
    format!("ws://{addr}")
}

/// Polls until the session row for the conversation has an end reason.
pub async fn wait_for_session_end(pool: &DbPool, conversation_id: &str) -> (String, i64, i64) {
    for _ in 0..100 {
        {
            let conn = pool.get().unwrap();
            let row: Option<(Option<String>, i64, i64)> = conn
                .query_row(
                    "SELECT end_reason, chunks_sent, chunks_received
                     FROM conversation_sessions
                     WHERE conversation_id = ?1
                     ORDER BY id DESC LIMIT 1",
                    [conversation_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .ok();
            if let Some((Some(reason), sent, received)) = row {
                return (reason, sent, received);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("session for {conversation_id} never closed");
}
