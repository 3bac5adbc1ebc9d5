//! System safety configuration row access.
//!
//! The configuration row is owned by the administrative service; this
//! module only reads it (and optionally seeds a default row for fresh
//! installs, behind an explicit opt-in).

use aria_types::SafetyConfig;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

/// Errors from safety-configuration access.
#[derive(Debug, Error)]
pub enum SafetyConfigError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A timestamp column held a value that is not RFC 3339.
    #[error("malformed timestamp in system_safety_config.{column}: {value}")]
    MalformedTimestamp { column: &'static str, value: String },
}

fn parse_ts(column: &'static str, value: String) -> Result<DateTime<Utc>, SafetyConfigError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SafetyConfigError::MalformedTimestamp { column, value })
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<(SafetyConfig, String, String, Option<String>)> {
    // Timestamps come out as raw strings; parsed by the caller so a
    // malformed value surfaces as a SafetyConfigError, not a rusqlite one.
    let config = SafetyConfig {
        id: row.get("id")?,
        plan_tier: row.get("plan_tier")?,
        monthly_credits: row.get("monthly_credits")?,
        credits_used: row.get("credits_used")?,
        estimated_minutes: row.get("estimated_minutes")?,
        minutes_used: row.get("minutes_used")?,
        period_start: Utc::now(),
        period_end: Utc::now(),
        max_concurrent_connections: row.get("max_concurrent_connections")?,
        max_voice_slots: row.get("max_voice_slots")?,
        max_conversation_minutes: row.get("max_conversation_minutes")?,
        max_daily_minutes_per_user: row.get("max_daily_minutes_per_user")?,
        max_daily_credits: row.get("max_daily_credits")?,
        credit_warning_threshold: row.get("credit_warning_threshold")?,
        credit_danger_threshold: row.get("credit_danger_threshold")?,
        enable_hard_limits: row.get("enable_hard_limits")?,
        enable_auto_stop: row.get("enable_auto_stop")?,
        enable_daily_limits: row.get("enable_daily_limits")?,
        maintenance_mode: row.get("maintenance_mode")?,
        maintenance_message: row.get("maintenance_message")?,
        maintenance_started_at: None,
        maintenance_toggled_by: row.get("maintenance_toggled_by")?,
    };
    let period_start: String = row.get("period_start")?;
    let period_end: String = row.get("period_end")?;
    let maintenance_started_at: Option<String> = row.get("maintenance_started_at")?;
    Ok((config, period_start, period_end, maintenance_started_at))
}

/// Loads the single active safety configuration row.
///
/// Returns `Ok(None)` when no active row exists — the caller decides
/// whether that is fatal (it is, everywhere except seeding).
pub fn load_active_config(conn: &Connection) -> Result<Option<SafetyConfig>, SafetyConfigError> {
    let found = conn
        .query_row(
            "SELECT * FROM system_safety_config WHERE is_active = 1",
            [],
            map_row,
        )
        .optional()?;

    let Some((mut config, period_start, period_end, maintenance_started_at)) = found else {
        return Ok(None);
    };

    config.period_start = parse_ts("period_start", period_start)?;
    config.period_end = parse_ts("period_end", period_end)?;
    config.maintenance_started_at = maintenance_started_at
        .map(|v| parse_ts("maintenance_started_at", v))
        .transpose()?;

    Ok(Some(config))
}

/// Inserts a default active configuration row if none exists.
///
/// This exists for fresh installs only and must be explicitly requested
/// (the server gates it behind `ARIA_SEED_DEFAULT_CONFIG=1`). A missing
/// configuration is otherwise a fatal deployment error — the service never
/// falls back to hardcoded limits silently.
///
/// Returns `true` if a row was inserted.
pub fn seed_default_config(conn: &Connection) -> Result<bool, SafetyConfigError> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM system_safety_config WHERE is_active = 1",
        [],
        |row| row.get(0),
    )?;
    if exists {
        return Ok(false);
    }

    let now = Utc::now();
    let period_end = now + Duration::days(30);
    conn.execute(
        "INSERT INTO system_safety_config (period_start, period_end, is_active)
         VALUES (?1, ?2, 1)",
        params![now.to_rfc3339(), period_end.to_rfc3339()],
    )?;

    tracing::warn!("seeded default system safety configuration — review limits before production use");
    Ok(true)
}
