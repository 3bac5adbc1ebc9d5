//! Conversation, session, and credit-usage ledgers.
//!
//! Append-only from the relay's perspective: sessions are opened once,
//! their counters only grow, and the final end-reason/end-timestamp pair
//! is written exactly once no matter how many code paths race to close.
//!
//! Also hosts the aggregation queries the quota checks read (open session
//! count, per-user daily minutes, system-wide daily credits), so the
//! enforcement layer never embeds SQL of its own.
//!
//! Every default query filters soft-deleted rows (`deleted_at IS NULL`)
//! at this boundary rather than relying on an implicit interceptor.

use aria_types::EndReason;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

/// A conversation row, as seen by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub identity_id: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub is_ai_call: bool,
    pub call_started_at: Option<String>,
    pub call_ended_at: Option<String>,
    pub minutes_used: i64,
}

/// A relay session ledger row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: i64,
    pub conversation_id: String,
    pub session_id: String,
    pub connection_id: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub chunks_sent: i64,
    pub chunks_received: i64,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub estimated_credits_used: i64,
    pub end_reason: Option<String>,
}

/// Parameters for opening a session ledger row.
#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub conversation_id: &'a str,
    pub session_id: &'a str,
    pub connection_id: &'a str,
    pub started_at: DateTime<Utc>,
}

/// Incremental session counters flushed during streaming.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsDelta {
    pub chunks_sent: i64,
    pub chunks_received: i64,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub estimated_credits_used: i64,
}

/// An append-only credit usage entry.
#[derive(Debug, Clone)]
pub struct CreditUsage<'a> {
    pub user_id: &'a str,
    pub conversation_id: Option<&'a str>,
    pub credits_used: i64,
    pub operation: &'a str,
    pub used_at: DateTime<Utc>,
    pub details: &'a str,
}

fn map_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        identity_id: row.get(2)?,
        started_at: row.get(3)?,
        ended_at: row.get(4)?,
        is_ai_call: row.get(5)?,
        call_started_at: row.get(6)?,
        call_ended_at: row.get(7)?,
        minutes_used: row.get(8)?,
    })
}

fn map_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        session_id: row.get(2)?,
        connection_id: row.get(3)?,
        started_at: row.get(4)?,
        ended_at: row.get(5)?,
        chunks_sent: row.get(6)?,
        chunks_received: row.get(7)?,
        bytes_sent: row.get(8)?,
        bytes_received: row.get(9)?,
        estimated_credits_used: row.get(10)?,
        end_reason: row.get(11)?,
    })
}

/// Resolves a conversation by id, confirming the caller owns it.
///
/// Not-found and not-owned are deliberately indistinguishable — both come
/// back as `ConversationNotFound` so the relay leaks nothing about other
/// users' conversations.
pub fn get_owned_conversation(
    conn: &Connection,
    conversation_id: &str,
    user_id: &str,
) -> Result<Conversation, LedgerError> {
    conn.query_row(
        "SELECT id, user_id, identity_id, started_at, ended_at,
                is_ai_call, call_started_at, call_ended_at, minutes_used
         FROM conversations
         WHERE id = ?1 AND user_id = ?2 AND deleted_at IS NULL",
        params![conversation_id, user_id],
        map_conversation,
    )
    .optional()?
    .ok_or_else(|| LedgerError::ConversationNotFound(conversation_id.to_string()))
}

/// Opens a session ledger row and marks the conversation as a live AI call.
///
/// `call_started_at` is only set on the first session of a conversation so
/// reconnects don't shift the daily-minutes accounting window.
pub fn create_session(conn: &Connection, session: &NewSession<'_>) -> Result<(), LedgerError> {
    let now = session.started_at.to_rfc3339();
    conn.execute(
        "INSERT INTO conversation_sessions
            (conversation_id, session_id, connection_id, started_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            session.conversation_id,
            session.session_id,
            session.connection_id,
            now,
        ],
    )?;
    conn.execute(
        "UPDATE conversations
         SET is_ai_call = 1,
             call_started_at = COALESCE(call_started_at, ?2)
         WHERE id = ?1",
        params![session.conversation_id, now],
    )?;
    Ok(())
}

/// Adds streaming counters to a session row. Counters only grow.
pub fn record_metrics(
    conn: &Connection,
    session_id: &str,
    delta: MetricsDelta,
) -> Result<(), LedgerError> {
    let updated = conn.execute(
        "UPDATE conversation_sessions
         SET chunks_sent = chunks_sent + ?2,
             chunks_received = chunks_received + ?3,
             bytes_sent = bytes_sent + ?4,
             bytes_received = bytes_received + ?5,
             estimated_credits_used = estimated_credits_used + ?6
         WHERE session_id = ?1",
        params![
            session_id,
            delta.chunks_sent,
            delta.chunks_received,
            delta.bytes_sent,
            delta.bytes_received,
            delta.estimated_credits_used,
        ],
    )?;
    if updated == 0 {
        return Err(LedgerError::SessionNotFound(session_id.to_string()));
    }
    Ok(())
}

/// Closes a session exactly once.
///
/// The conditional update means the first caller wins; racing closers (the
/// two pumps, the error path, shutdown) see `false` and do nothing. The
/// end-reason recorded is always the first one that actually ended the
/// session.
pub fn close_session(
    conn: &Connection,
    session_id: &str,
    reason: EndReason,
    ended_at: DateTime<Utc>,
) -> Result<bool, LedgerError> {
    let updated = conn.execute(
        "UPDATE conversation_sessions
         SET ended_at = ?2, end_reason = ?3
         WHERE session_id = ?1 AND ended_at IS NULL",
        params![session_id, ended_at.to_rfc3339(), reason.as_str()],
    )?;
    Ok(updated > 0)
}

/// Records call end on the conversation: end timestamp plus minutes used.
pub fn finish_call(
    conn: &Connection,
    conversation_id: &str,
    minutes: i64,
    ended_at: DateTime<Utc>,
) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE conversations
         SET call_ended_at = ?2, minutes_used = minutes_used + ?3
         WHERE id = ?1",
        params![conversation_id, ended_at.to_rfc3339(), minutes],
    )?;
    Ok(())
}

/// Appends a credit usage audit entry.
pub fn log_credit_usage(conn: &Connection, usage: &CreditUsage<'_>) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO credit_usage_log
            (user_id, conversation_id, credits_used, operation, used_at, details)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            usage.user_id,
            usage.conversation_id,
            usage.credits_used,
            usage.operation,
            usage.used_at.to_rfc3339(),
            usage.details,
        ],
    )?;
    Ok(())
}

/// Fetches a session ledger row by its public session id.
pub fn get_session(conn: &Connection, session_id: &str) -> Result<SessionRecord, LedgerError> {
    conn.query_row(
        "SELECT id, conversation_id, session_id, connection_id, started_at, ended_at,
                chunks_sent, chunks_received, bytes_sent, bytes_received,
                estimated_credits_used, end_reason
         FROM conversation_sessions WHERE session_id = ?1",
        [session_id],
        map_session,
    )
    .optional()?
    .ok_or_else(|| LedgerError::SessionNotFound(session_id.to_string()))
}

/// Returns the UTC start-of-day for `now`, as the RFC 3339 string the
/// daily aggregations compare against.
fn utc_day_start(now: DateTime<Utc>) -> String {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc()
        .to_rfc3339()
}

/// Number of sessions with no end timestamp — the concurrency measure.
pub fn count_open_sessions(conn: &Connection) -> Result<i64, LedgerError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM conversation_sessions WHERE ended_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Minutes of AI-call conversation the user has consumed since UTC midnight.
pub fn minutes_used_today(
    conn: &Connection,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<i64, LedgerError> {
    let minutes = conn.query_row(
        "SELECT COALESCE(SUM(minutes_used), 0) FROM conversations
         WHERE user_id = ?1 AND is_ai_call = 1
           AND call_started_at >= ?2 AND deleted_at IS NULL",
        params![user_id, utc_day_start(now)],
        |row| row.get(0),
    )?;
    Ok(minutes)
}

/// System-wide credits consumed since UTC midnight.
pub fn credits_used_today(conn: &Connection, now: DateTime<Utc>) -> Result<i64, LedgerError> {
    let credits = conn.query_row(
        "SELECT COALESCE(SUM(credits_used), 0) FROM credit_usage_log WHERE used_at >= ?1",
        [utc_day_start(now)],
        |row| row.get(0),
    )?;
    Ok(credits)
}
