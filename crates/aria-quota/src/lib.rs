//! Multi-layer usage quota enforcement.
//!
//! Four independent checks (concurrency, per-user daily minutes,
//! system-wide daily credits, monthly credit pool), a composite pre-flight
//! gate that short-circuits on the first failure, an in-flight check run
//! periodically during streaming, and a health predicate used for
//! circuit-breaking.
//!
//! Each denial carries a stable machine-readable code (see
//! [`aria_types::quota_codes`]) that clients branch on; the codes are part
//! of the wire contract and never change.
//!
//! All checks are synchronous functions over a database connection and a
//! cached [`SafetyConfig`] snapshot — callers run them inside
//! `spawn_blocking` and decide how stale a snapshot they tolerate.

use aria_ledger::LedgerError;
use aria_types::{quota_codes, SafetyConfig};
use chrono::Utc;
use rusqlite::Connection;
use thiserror::Error;

/// Errors from quota enforcement: either a denial or an infrastructure
/// failure while measuring usage.
#[derive(Debug, Error)]
pub enum QuotaError {
    /// A limit was hit. `code` is the stable client-facing string.
    #[error("{message}")]
    Exceeded {
        code: &'static str,
        message: String,
    },

    /// The usage aggregation itself failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl QuotaError {
    /// Returns the machine-readable code for a denial, `None` for
    /// infrastructure failures.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Exceeded { code, .. } => Some(code),
            Self::Ledger(_) => None,
        }
    }
}

/// Check 1: currently-open sessions must stay under the configured
/// ceiling. Skipped entirely when hard limits are disabled.
pub fn check_concurrency(conn: &Connection, config: &SafetyConfig) -> Result<(), QuotaError> {
    if !config.enable_hard_limits {
        return Ok(());
    }

    let active = aria_ledger::count_open_sessions(conn)?;
    if active >= config.max_concurrent_connections {
        return Err(QuotaError::Exceeded {
            code: quota_codes::CONCURRENCY_LIMIT_EXCEEDED,
            message: format!(
                "Maximum concurrent connections ({}) reached. Active: {}",
                config.max_concurrent_connections, active
            ),
        });
    }
    Ok(())
}

/// Check 2: the user's AI-call minutes since UTC midnight must stay under
/// the per-user daily ceiling. Skipped when daily limits are disabled.
pub fn check_daily_user(
    conn: &Connection,
    config: &SafetyConfig,
    user_id: &str,
) -> Result<(), QuotaError> {
    if !config.enable_daily_limits {
        return Ok(());
    }

    let today_minutes = aria_ledger::minutes_used_today(conn, user_id, Utc::now())?;
    if today_minutes >= config.max_daily_minutes_per_user {
        return Err(QuotaError::Exceeded {
            code: quota_codes::DAILY_USER_LIMIT_EXCEEDED,
            message: format!(
                "Daily user limit ({} minutes) exceeded. Used: {}",
                config.max_daily_minutes_per_user, today_minutes
            ),
        });
    }
    Ok(())
}

/// Check 3: system-wide credits consumed since UTC midnight must stay
/// under the daily ceiling. Skipped when daily limits are disabled.
pub fn check_daily_system(conn: &Connection, config: &SafetyConfig) -> Result<(), QuotaError> {
    if !config.enable_daily_limits {
        return Ok(());
    }

    let today_credits = aria_ledger::credits_used_today(conn, Utc::now())?;
    if today_credits >= config.max_daily_credits {
        return Err(QuotaError::Exceeded {
            code: quota_codes::DAILY_SYSTEM_LIMIT_EXCEEDED,
            message: format!(
                "Daily system credit limit exceeded. Used: {}/{}",
                today_credits, config.max_daily_credits
            ),
        });
    }
    Ok(())
}

/// Check 4: the derived remaining monthly credit pool must be positive.
/// Never skipped — this is the hard monthly ceiling.
pub fn check_credit_availability(config: &SafetyConfig) -> Result<(), QuotaError> {
    if config.remaining_credits() <= 0 {
        return Err(QuotaError::Exceeded {
            code: quota_codes::MONTHLY_CREDIT_LIMIT_EXCEEDED,
            message: format!("Monthly credit limit exceeded. Plan: {}", config.plan_tier),
        });
    }
    Ok(())
}

/// Admission gate run before a relay session starts.
///
/// Runs the four checks in a fixed order — cheap/local first, the monthly
/// ceiling last — and returns the first failure verbatim:
/// concurrency → daily-user → daily-system → credit availability.
pub fn pre_flight(
    conn: &Connection,
    config: &SafetyConfig,
    user_id: &str,
) -> Result<(), QuotaError> {
    check_concurrency(conn, config)?;
    check_daily_user(conn, config, user_id)?;
    check_daily_system(conn, config)?;
    check_credit_availability(config)?;
    Ok(())
}

/// Re-validation run periodically while a session is streaming.
///
/// `elapsed_minutes` is wall-clock time since the session started; it is
/// added to the user's recorded daily minutes so a long call cannot blow
/// through the daily cap after admission. Also re-checks the monthly pool
/// and, when auto-stop is enabled, the per-conversation minute ceiling.
pub fn check_in_flight(
    conn: &Connection,
    config: &SafetyConfig,
    user_id: &str,
    elapsed_minutes: f64,
) -> Result<(), QuotaError> {
    let elapsed = elapsed_minutes.floor() as i64;

    if config.enable_daily_limits {
        let today_minutes = aria_ledger::minutes_used_today(conn, user_id, Utc::now())?;
        if today_minutes + elapsed >= config.max_daily_minutes_per_user {
            return Err(QuotaError::Exceeded {
                code: quota_codes::DAILY_USER_LIMIT_EXCEEDED,
                message: format!(
                    "Daily user limit ({} minutes) exceeded. Used: {}",
                    config.max_daily_minutes_per_user,
                    today_minutes + elapsed
                ),
            });
        }
    }

    check_credit_availability(config)?;

    if config.enable_auto_stop && elapsed >= config.max_conversation_minutes {
        return Err(QuotaError::Exceeded {
            code: quota_codes::CONVERSATION_LIMIT_EXCEEDED,
            message: format!(
                "Conversation limit ({} minutes) reached",
                config.max_conversation_minutes
            ),
        });
    }

    Ok(())
}

/// Circuit breaker: false once credit burn crosses the danger threshold
/// (e.g. 95% of the monthly pool). Callers use this to degrade
/// pre-emptively — refusing new voice cloning, for instance — before the
/// hard limits actually trip.
pub fn is_system_healthy(config: &SafetyConfig) -> bool {
    let danger = config.monthly_credits as f64 * config.credit_danger_threshold;
    (config.credits_used as f64) < danger
}
