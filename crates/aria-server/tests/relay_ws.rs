//! End-to-end relay tests against an in-process fake provider.

mod common;

use common::*;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite};

fn relay_url(harness: &TestHarness, conversation_id: &str, token: &str) -> String {
    format!(
        "ws://{}/ws/conversations/{}?token={}",
        harness.addr, conversation_id, token
    )
}

#[tokio::test]
async fn round_trips_audio_and_records_user_disconnect() {
    let provider = spawn_echo_provider().await;
    let harness = spawn_app(&provider).await;
    add_active_slot(&harness.pool, "i1", "voice-e2e");

    let (mut ws, _) = connect_async(relay_url(&harness, "c1", "tok-1"))
        .await
        .expect("relay upgrade should succeed");

    let chunks: Vec<Vec<u8>> = vec![vec![1u8; 4096], vec![2u8; 16_384], vec![3u8; 100]];
    for chunk in &chunks {
        ws.send(tungstenite::Message::Binary(chunk.clone()))
            .await
            .expect("send audio");
    }

    // The echo provider reflects every frame; bytes must come back
    // unmodified and in order.
    for expected in &chunks {
        loop {
            let msg = ws.next().await.expect("stream open").expect("frame");
            match msg {
                tungstenite::Message::Binary(data) => {
                    assert_eq!(&data, expected, "audio bytes must round-trip verbatim");
                    break;
                }
                tungstenite::Message::Text(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    ws.close(None).await.expect("close");

    let (reason, sent, received) = wait_for_session_end(&harness.pool, "c1").await;
    assert_eq!(reason, "USER_DISCONNECT");
    assert_eq!(sent, 3);
    assert_eq!(received, 3);
}

#[tokio::test]
async fn admission_rejection_sends_error_frame_then_policy_close() {
    let provider = spawn_echo_provider().await;
    let harness = spawn_app(&provider).await;

    // Exhaust the monthly pool and make the cache see it.
    update_config(&harness.pool, "credits_used = monthly_credits");
    harness.cache.invalidate().await;

    let (mut ws, _) = connect_async(relay_url(&harness, "c1", "tok-1"))
        .await
        .expect("upgrade still completes so the client can read the error");

    let msg = ws.next().await.expect("frame").expect("frame");
    let text = match msg {
        tungstenite::Message::Text(text) => text,
        other => panic!("expected error frame first, got {other:?}"),
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "error");
    assert!(value["message"]
        .as_str()
        .unwrap()
        .contains("Monthly credit limit exceeded"));

    // Then a policy-violation close.
    match ws.next().await {
        Some(Ok(tungstenite::Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 1008);
        }
        Some(Ok(tungstenite::Message::Close(None))) | None => {}
        other => panic!("expected close, got {other:?}"),
    }

    // Rejected before the session row is created.
    let conn = harness.pool.get().unwrap();
    let sessions: i64 = conn
        .query_row("SELECT COUNT(*) FROM conversation_sessions", [], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(sessions, 0);
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let provider = spawn_echo_provider().await;
    let harness = spawn_app(&provider).await;

    let url = format!("ws://{}/ws/conversations/c1", harness.addr);
    let err = connect_async(url).await.expect_err("must reject");
    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn unowned_conversation_is_not_found() {
    let provider = spawn_echo_provider().await;
    let harness = spawn_app(&provider).await;
    {
        let conn = harness.pool.get().unwrap();
        conn.execute(
            "INSERT INTO users (id, auth_token) VALUES ('u2', 'tok-2')",
            [],
        )
        .unwrap();
    }

    let err = connect_async(relay_url(&harness, "c1", "tok-2"))
        .await
        .expect_err("must reject");
    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn provider_close_completes_the_session() {
    let provider = spawn_closing_provider().await;
    let harness = spawn_app(&provider).await;
    add_active_slot(&harness.pool, "i1", "voice-closing");

    let (mut ws, _) = connect_async(relay_url(&harness, "c1", "tok-1"))
        .await
        .expect("relay upgrade should succeed");

    // Drain until the server closes our leg.
    while let Some(Ok(msg)) = ws.next().await {
        if matches!(msg, tungstenite::Message::Close(_)) {
            break;
        }
    }

    let (reason, _, _) = wait_for_session_end(&harness.pool, "c1").await;
    assert_eq!(reason, "COMPLETED");
}

#[tokio::test]
async fn idle_session_times_out() {
    let provider = spawn_silent_provider().await;
    let harness =
        spawn_app_with_idle(&provider, std::time::Duration::from_millis(300)).await;
    add_active_slot(&harness.pool, "i1", "voice-idle");

    let (mut ws, _) = connect_async(relay_url(&harness, "c1", "tok-1"))
        .await
        .expect("relay upgrade should succeed");

    // Neither leg sends anything; the idle window expires and the server
    // closes our connection.
    let closed = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, tungstenite::Message::Close(_)) {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server must close an idle connection");

    let (reason, _, _) = wait_for_session_end(&harness.pool, "c1").await;
    assert_eq!(reason, "TIMEOUT");
}

#[tokio::test]
async fn mid_session_credit_exhaustion_warns_then_ends() {
    let provider = spawn_echo_provider().await;
    let harness = spawn_app(&provider).await;
    add_active_slot(&harness.pool, "i1", "voice-limit");

    let (mut ws, _) = connect_async(relay_url(&harness, "c1", "tok-1"))
        .await
        .expect("relay upgrade should succeed");

    // Stream a little, then pull the rug: credits run out and the admin
    // service invalidates the cache.
    ws.send(tungstenite::Message::Binary(vec![9u8; 1024]))
        .await
        .unwrap();
    update_config(&harness.pool, "credits_used = monthly_credits");
    harness.cache.invalidate().await;

    // Keep sending until the in-flight check trips (at most once per 50ms
    // here); the server must deliver a warning frame before closing.
    let mut saw_warning = false;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        if ws
            .send(tungstenite::Message::Binary(vec![7u8; 512]))
            .await
            .is_err()
        {
            break;
        }
        while let Ok(Some(Ok(msg))) = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            ws.next(),
        )
        .await
        {
            match msg {
                tungstenite::Message::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == "warning" {
                        saw_warning = true;
                    }
                }
                tungstenite::Message::Close(_) => break,
                _ => {}
            }
        }
        if saw_warning {
            break;
        }
    }
    assert!(saw_warning, "client must receive a warning frame");

    let (reason, _, _) = wait_for_session_end(&harness.pool, "c1").await;
    assert_eq!(reason, "CREDIT_LIMIT");

    // Exactly one credit audit row for the session.
    let conn = harness.pool.get().unwrap();
    let audit_rows: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM credit_usage_log WHERE operation = 'relay'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(audit_rows, 1);
}
