//! The relay WebSocket endpoint: one live bidirectional audio connection
//! between a client and the speech provider.
//!
//! Entry sequence (fail-fast): authenticate → resolve owned conversation →
//! pre-flight quota gate → session ledger row → voice slot → provider
//! WebSocket. Then two concurrent pumps move binary frames verbatim, one
//! per direction, until either finishes; the first to finish decides the
//! end reason and the other is cancelled. The final ledger write happens
//! exactly once regardless of which path got there.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as ClientMessage, Utf8Bytes, WebSocket},
        Extension, Path, Query, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as ProviderMessage;
use uuid::Uuid;

use aria_ledger::{Conversation, CreditUsage, LedgerError, MetricsDelta, NewSession};
use aria_provider::VoiceStream;
use aria_quota::QuotaError;
use aria_types::{quota_codes, EndReason};

use crate::middleware::{authenticate_token, AuthedUser};
use crate::AppState;

/// Estimated provider credits consumed per minute of streaming. Matches
/// the plan arithmetic (10 000 monthly credits ≈ 20 minutes).
const CREDITS_PER_MINUTE: i64 = 500;

/// Query parameters for the relay connection. The bearer token is also
/// accepted here because browser WebSocket clients cannot set headers.
#[derive(Debug, Deserialize)]
pub struct RelayParams {
    pub token: Option<String>,
}

/// Server→client text control frame.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlFrame {
    Warning { message: String },
    Error { message: String },
}

fn control_frame_json(frame: &ControlFrame) -> String {
    serde_json::to_string(frame).unwrap_or_else(|_| r#"{"type":"error","message":""}"#.to_string())
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// `GET /ws/conversations/{conversationId}` — the relay endpoint.
///
/// Authentication and ownership failures reject the upgrade with an HTTP
/// status; quota failures complete the upgrade so the client receives a
/// machine-readable error frame before the policy-violation close.
pub async fn relay_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Query(params): Query<RelayParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = bearer_from_headers(&headers).or(params.token.as_deref()) else {
        tracing::warn!(conversation_id = %conversation_id, "relay connect missing bearer token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let user = match authenticate_token(&state, token).await {
        Ok(user) => user,
        Err(code) => {
            tracing::warn!(conversation_id = %conversation_id, status = %code, "relay auth failed");
            return code.into_response();
        }
    };

    let conversation = {
        let pool = state.pool.clone();
        let cid = conversation_id.clone();
        let uid = user.id.clone();
        let result = tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| e.to_string())?;
            Ok::<_, String>(aria_ledger::get_owned_conversation(&conn, &cid, &uid))
        })
        .await;

        match result {
            Ok(Ok(Ok(conversation))) => conversation,
            Ok(Ok(Err(LedgerError::ConversationNotFound(_)))) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    user_id = %user.id,
                    "relay connect for unknown or unowned conversation"
                );
                return StatusCode::NOT_FOUND.into_response();
            }
            Ok(Ok(Err(e))) => {
                tracing::error!("conversation lookup failed: {}", e);
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            Ok(Err(e)) => {
                tracing::error!("conversation lookup failed: {}", e);
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            Err(e) => {
                tracing::error!("conversation lookup task failed: {}", e);
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    };

    tracing::info!(
        conversation_id = %conversation.id,
        user_id = %user.id,
        "relay connection accepted, upgrading"
    );
    ws.on_upgrade(move |socket| run_relay(socket, state, user, conversation))
}

/// Sends an error frame and a policy-violation close, then drops the
/// socket. Used for failures after the upgrade but before streaming.
async fn reject_socket(mut socket: WebSocket, message: &str) {
    let frame = control_frame_json(&ControlFrame::Error {
        message: message.to_string(),
    });
    let _ = socket.send(ClientMessage::Text(frame.into())).await;
    let _ = socket
        .send(ClientMessage::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Utf8Bytes::from(message.to_string()),
        })))
        .await;
}

/// Drives one relay session from admission through the final ledger write.
async fn run_relay(
    socket: WebSocket,
    state: Arc<AppState>,
    user: AuthedUser,
    conversation: Conversation,
) {
    let config = match state.config_cache.get().await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("relay admission failed to read configuration: {}", e);
            reject_socket(socket, "Service configuration unavailable").await;
            return;
        }
    };

    // Pre-flight admission gate. The first failing check wins and its
    // message reaches the client verbatim.
    let pre_flight = {
        let pool = state.pool.clone();
        let cfg = config.clone();
        let uid = user.id.clone();
        tokio::task::spawn_blocking(move || -> Result<Result<(), QuotaError>, String> {
            let conn = pool.get().map_err(|e| e.to_string())?;
            Ok(aria_quota::pre_flight(&conn, &cfg, &uid))
        })
        .await
    };
    match pre_flight {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(QuotaError::Exceeded { code, message }))) => {
            tracing::info!(
                user_id = %user.id,
                conversation_id = %conversation.id,
                code = code,
                "relay admission rejected"
            );
            reject_socket(socket, &message).await;
            return;
        }
        Ok(Ok(Err(QuotaError::Ledger(e)))) => {
            tracing::error!("pre-flight quota check failed: {}", e);
            reject_socket(socket, "Internal error during admission").await;
            return;
        }
        Ok(Err(e)) => {
            tracing::error!("pre-flight quota check failed: {}", e);
            reject_socket(socket, "Internal error during admission").await;
            return;
        }
        Err(e) => {
            tracing::error!("pre-flight task failed: {}", e);
            reject_socket(socket, "Internal error during admission").await;
            return;
        }
    }

    let session_id = Uuid::new_v4().to_string();
    let connection_id = Uuid::new_v4().to_string();
    let started_at = Utc::now();

    let created = {
        let pool = state.pool.clone();
        let cid = conversation.id.clone();
        let sid = session_id.clone();
        let conn_id = connection_id.clone();
        tokio::task::spawn_blocking(move || -> Result<(), String> {
            let conn = pool.get().map_err(|e| e.to_string())?;
            let session = NewSession {
                conversation_id: &cid,
                session_id: &sid,
                connection_id: &conn_id,
                started_at,
            };
            aria_ledger::create_session(&conn, &session).map_err(|e| e.to_string())
        })
        .await
    };
    match created {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!("failed to create session ledger row: {}", e);
            reject_socket(socket, "Internal error starting session").await;
            return;
        }
        Err(e) => {
            tracing::error!("session create task failed: {}", e);
            reject_socket(socket, "Internal error starting session").await;
            return;
        }
    }

    let pending = Arc::new(Mutex::new(MetricsDelta::default()));

    // Voice slot, then the outbound provider leg. Failures past this point
    // already have a session row to close.
    let voice_id = match state.slots.ensure_slot(&conversation.identity_id, &config).await {
        Ok(voice_id) => voice_id,
        Err(e) => {
            tracing::error!(
                identity_id = %conversation.identity_id,
                "voice slot acquisition failed: {}",
                e
            );
            reject_socket(socket, "Voice unavailable for this conversation").await;
            finalize_session(
                &state,
                &user.id,
                &conversation.id,
                &session_id,
                EndReason::Error,
                started_at,
                &pending,
            )
            .await;
            return;
        }
    };

    let provider_stream = match state.provider.connect_stream(&voice_id).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(voice_id = %voice_id, "provider stream connect failed: {}", e);
            reject_socket(socket, "Speech provider unavailable").await;
            finalize_session(
                &state,
                &user.id,
                &conversation.id,
                &session_id,
                EndReason::Error,
                started_at,
                &pending,
            )
            .await;
            return;
        }
    };

    tracing::info!(
        session_id = %session_id,
        conversation_id = %conversation.id,
        voice_id = %voice_id,
        "relay session streaming"
    );

    let (client_sink, client_stream) = socket.split();
    let (provider_sink, provider_source) = provider_stream.split();

    // The client sink is owned by a forwarder task fed by a channel, so
    // both the outbound pump (audio) and the inbound pump (warning frames)
    // can reach the client without sharing the sink.
    let (tx, rx) = mpsc::channel::<ClientMessage>(256);
    let forward_task = tokio::spawn(forward_to_client(client_sink, rx));

    let mut inbound = tokio::spawn(inbound_pump(
        state.clone(),
        client_stream,
        provider_sink,
        tx.clone(),
        user.id.clone(),
        session_id.clone(),
        started_at,
        pending.clone(),
    ));
    let mut outbound = tokio::spawn(outbound_pump(
        state.clone(),
        provider_source,
        tx.clone(),
        pending.clone(),
    ));

    // First pump to finish decides the end reason; the other is cancelled.
    let reason = tokio::select! {
        finished = &mut inbound => {
            outbound.abort();
            finished.unwrap_or(EndReason::Error)
        }
        finished = &mut outbound => {
            inbound.abort();
            finished.unwrap_or(EndReason::Error)
        }
    };

    let close_frame = match reason {
        EndReason::LimitExceeded | EndReason::CreditLimit => Some(CloseFrame {
            code: close_code::POLICY,
            reason: Utf8Bytes::from_static("quota exceeded"),
        }),
        _ => None,
    };
    let _ = tx.send(ClientMessage::Close(close_frame)).await;
    drop(tx);
    let _ = forward_task.await;

    finalize_session(
        &state,
        &user.id,
        &conversation.id,
        &session_id,
        reason,
        started_at,
        &pending,
    )
    .await;
}

/// Forwards queued frames to the client until the channel closes or the
/// socket errors.
async fn forward_to_client(
    mut sink: SplitSink<WebSocket, ClientMessage>,
    mut rx: mpsc::Receiver<ClientMessage>,
) {
    while let Some(msg) = rx.recv().await {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
}

fn take_pending(pending: &Mutex<MetricsDelta>) -> MetricsDelta {
    let mut guard = pending.lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::take(&mut *guard)
}

fn add_pending(pending: &Mutex<MetricsDelta>, add: MetricsDelta) {
    let mut guard = pending.lock().unwrap_or_else(PoisonError::into_inner);
    guard.chunks_sent += add.chunks_sent;
    guard.chunks_received += add.chunks_received;
    guard.bytes_sent += add.bytes_sent;
    guard.bytes_received += add.bytes_received;
    guard.estimated_credits_used += add.estimated_credits_used;
}

/// Outcome of an in-flight quota evaluation that must stop the session.
struct InFlightStop {
    reason: EndReason,
    message: String,
}

/// Re-validates quotas mid-session and flushes accumulated metrics to the
/// ledger on the same cadence.
///
/// Internal errors (pool exhaustion, transient DB failure) are logged and
/// the stream continues; admission was already granted and killing a live
/// call over a flaky aggregation query is the worse trade.
async fn run_in_flight_check(
    state: &Arc<AppState>,
    user_id: &str,
    session_id: &str,
    started_at: DateTime<Utc>,
    pending: &Arc<Mutex<MetricsDelta>>,
) -> Result<(), InFlightStop> {
    let config = match state.config_cache.get().await {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("in-flight check skipped, configuration unavailable: {}", e);
            return Ok(());
        }
    };

    let elapsed_minutes = (Utc::now() - started_at).num_seconds() as f64 / 60.0;
    let delta = take_pending(pending);

    let pool = state.pool.clone();
    let uid = user_id.to_string();
    let sid = session_id.to_string();
    let result = tokio::task::spawn_blocking(move || -> Result<Result<(), QuotaError>, String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        if let Err(e) = aria_ledger::record_metrics(&conn, &sid, delta) {
            tracing::warn!(session_id = %sid, "metrics flush failed: {}", e);
        }
        Ok(aria_quota::check_in_flight(
            &conn,
            &config,
            &uid,
            elapsed_minutes,
        ))
    })
    .await;

    match result {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(QuotaError::Exceeded { code, message }))) => {
            let reason = if code == quota_codes::MONTHLY_CREDIT_LIMIT_EXCEEDED {
                EndReason::CreditLimit
            } else {
                EndReason::LimitExceeded
            };
            Err(InFlightStop { reason, message })
        }
        Ok(Ok(Err(QuotaError::Ledger(e)))) => {
            tracing::warn!("in-flight check errored, continuing: {}", e);
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::warn!("in-flight check errored, continuing: {}", e);
            Ok(())
        }
        Err(e) => {
            tracing::warn!("in-flight check task failed, continuing: {}", e);
            Ok(())
        }
    }
}

/// Client → provider. Re-runs the in-flight quota check at most once per
/// configured interval; frames between checks are forwarded unchecked.
#[allow(clippy::too_many_arguments)]
async fn inbound_pump(
    state: Arc<AppState>,
    mut client_stream: SplitStream<WebSocket>,
    mut provider_sink: SplitSink<VoiceStream, ProviderMessage>,
    tx: mpsc::Sender<ClientMessage>,
    user_id: String,
    session_id: String,
    started_at: DateTime<Utc>,
    pending: Arc<Mutex<MetricsDelta>>,
) -> EndReason {
    let idle = state.relay.idle_timeout;
    let check_interval = state.relay.check_interval;
    let mut last_check = Instant::now();

    loop {
        let frame = match timeout(idle, client_stream.next()).await {
            Err(_) => return EndReason::Timeout,
            Ok(None) => return EndReason::UserDisconnect,
            Ok(Some(Err(e))) => {
                tracing::warn!(session_id = %session_id, "client receive error: {}", e);
                return EndReason::Error;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            ClientMessage::Binary(data) => {
                if last_check.elapsed() >= check_interval {
                    last_check = Instant::now();
                    if let Err(stop) =
                        run_in_flight_check(&state, &user_id, &session_id, started_at, &pending)
                            .await
                    {
                        let warning = control_frame_json(&ControlFrame::Warning {
                            message: stop.message,
                        });
                        let _ = tx.send(ClientMessage::Text(warning.into())).await;
                        return stop.reason;
                    }
                }

                let len = data.len() as i64;
                if provider_sink
                    .send(ProviderMessage::Binary(data.to_vec()))
                    .await
                    .is_err()
                {
                    return EndReason::Error;
                }
                add_pending(
                    &pending,
                    MetricsDelta {
                        chunks_sent: 1,
                        bytes_sent: len,
                        ..Default::default()
                    },
                );
            }
            ClientMessage::Close(_) => return EndReason::UserDisconnect,
            // Audio travels in binary frames only; client text frames and
            // transport pings carry nothing to forward.
            ClientMessage::Text(_) | ClientMessage::Ping(_) | ClientMessage::Pong(_) => {}
        }
    }
}

/// Provider → client. Frames are forwarded verbatim through the client
/// forwarder channel.
async fn outbound_pump(
    state: Arc<AppState>,
    mut provider_source: SplitStream<VoiceStream>,
    tx: mpsc::Sender<ClientMessage>,
    pending: Arc<Mutex<MetricsDelta>>,
) -> EndReason {
    let idle = state.relay.idle_timeout;

    loop {
        let msg = match timeout(idle, provider_source.next()).await {
            Err(_) => return EndReason::Timeout,
            Ok(None) => return EndReason::Completed,
            Ok(Some(Err(e))) => {
                tracing::warn!("provider receive error: {}", e);
                return EndReason::Error;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            ProviderMessage::Binary(data) => {
                let len = data.len() as i64;
                if tx.send(ClientMessage::Binary(data.into())).await.is_err() {
                    return EndReason::Error;
                }
                add_pending(
                    &pending,
                    MetricsDelta {
                        chunks_received: 1,
                        bytes_received: len,
                        ..Default::default()
                    },
                );
            }
            ProviderMessage::Text(text) => {
                // Provider-side metadata frames pass through untouched.
                if tx
                    .send(ClientMessage::Text(text.to_string().into()))
                    .await
                    .is_err()
                {
                    return EndReason::Error;
                }
            }
            ProviderMessage::Close(_) => return EndReason::Completed,
            ProviderMessage::Ping(_) | ProviderMessage::Pong(_) | ProviderMessage::Frame(_) => {}
        }
    }
}

/// Writes the session's terminal state: residual metrics, the
/// exactly-once close, the conversation call summary, and the credit
/// audit row. Racing closers are no-ops past `close_session`.
async fn finalize_session(
    state: &Arc<AppState>,
    user_id: &str,
    conversation_id: &str,
    session_id: &str,
    reason: EndReason,
    started_at: DateTime<Utc>,
    pending: &Arc<Mutex<MetricsDelta>>,
) {
    let ended_at = Utc::now();
    let elapsed_minutes = (ended_at - started_at).num_minutes().max(0);
    let credits = elapsed_minutes * CREDITS_PER_MINUTE;

    let mut delta = take_pending(pending);
    delta.estimated_credits_used += credits;

    let pool = state.pool.clone();
    let uid = user_id.to_string();
    let cid = conversation_id.to_string();
    let sid = session_id.to_string();
    let result = tokio::task::spawn_blocking(move || -> Result<(), String> {
        let conn = pool.get().map_err(|e| e.to_string())?;

        if let Err(e) = aria_ledger::record_metrics(&conn, &sid, delta) {
            tracing::warn!(session_id = %sid, "final metrics flush failed: {}", e);
        }

        let first_close = aria_ledger::close_session(&conn, &sid, reason, ended_at)
            .map_err(|e| e.to_string())?;
        if first_close {
            aria_ledger::finish_call(&conn, &cid, elapsed_minutes, ended_at)
                .map_err(|e| e.to_string())?;
            aria_ledger::log_credit_usage(
                &conn,
                &CreditUsage {
                    user_id: &uid,
                    conversation_id: Some(&cid),
                    credits_used: credits,
                    operation: "relay",
                    used_at: ended_at,
                    details: &format!("session {} ended: {}", sid, reason.as_str()),
                },
            )
            .map_err(|e| e.to_string())?;
        }
        Ok(())
    })
    .await;

    match result {
        Ok(Ok(())) => {
            tracing::info!(
                session_id = %session_id,
                conversation_id = %conversation_id,
                reason = reason.as_str(),
                minutes = elapsed_minutes,
                "relay session closed"
            );
        }
        Ok(Err(e)) => {
            tracing::error!(session_id = %session_id, "session finalize failed: {}", e);
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, "session finalize task failed: {}", e);
        }
    }
}
