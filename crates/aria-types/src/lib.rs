//! Shared types and constants for the Aria voice relay.
//!
//! This crate provides the foundational types used across all Aria crates:
//! the system safety configuration, relay session end reasons, and the
//! machine-readable quota failure codes consumed by clients.
//!
//! No crate in the workspace depends on anything *except* `aria-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a relay session ended. Written exactly once per session to the
/// session ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// The provider leg closed cleanly mid-stream.
    Normal,
    /// A receive on either leg exceeded the idle timeout.
    Timeout,
    /// The monthly credit pool ran out during the session.
    CreditLimit,
    /// The client sent a close frame.
    UserDisconnect,
    /// A transport or internal error on either leg.
    Error,
    /// An in-flight quota check failed.
    LimitExceeded,
    /// The session ran to completion (provider finished the stream).
    Completed,
}

impl EndReason {
    /// Returns the string stored in the `end_reason` ledger column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Timeout => "TIMEOUT",
            Self::CreditLimit => "CREDIT_LIMIT",
            Self::UserDisconnect => "USER_DISCONNECT",
            Self::Error => "ERROR",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::Completed => "COMPLETED",
        }
    }

    /// Parses a ledger `end_reason` string back into an `EndReason`.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "NORMAL" => Some(Self::Normal),
            "TIMEOUT" => Some(Self::Timeout),
            "CREDIT_LIMIT" => Some(Self::CreditLimit),
            "USER_DISCONNECT" => Some(Self::UserDisconnect),
            "ERROR" => Some(Self::Error),
            "LIMIT_EXCEEDED" => Some(Self::LimitExceeded),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Machine-readable codes for quota admission failures.
///
/// These strings are part of the client contract and must never change:
/// clients branch on them to pick the user-facing message ("upgrade plan"
/// vs. "too many active calls").
pub mod quota_codes {
    pub const CONCURRENCY_LIMIT_EXCEEDED: &str = "CONCURRENCY_LIMIT_EXCEEDED";
    pub const DAILY_USER_LIMIT_EXCEEDED: &str = "DAILY_USER_LIMIT_EXCEEDED";
    pub const DAILY_SYSTEM_LIMIT_EXCEEDED: &str = "DAILY_SYSTEM_LIMIT_EXCEEDED";
    pub const MONTHLY_CREDIT_LIMIT_EXCEEDED: &str = "MONTHLY_CREDIT_LIMIT_EXCEEDED";
    /// Auto-stop: the session reached the per-conversation minute ceiling.
    pub const CONVERSATION_LIMIT_EXCEEDED: &str = "CONVERSATION_LIMIT_EXCEEDED";
}

/// The single active system safety configuration row.
///
/// Mutated only by the administrative service; read by every quota check
/// and the maintenance gate through the configuration cache. Remaining
/// credits/minutes are derived, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyConfig {
    /// Internal database ID of the active row.
    pub id: i64,
    /// Provider plan tier label (Free, Starter, Creator, ...).
    pub plan_tier: String,
    /// Monthly credit pool for the current billing period.
    pub monthly_credits: i64,
    /// Credits consumed so far this billing period.
    pub credits_used: i64,
    /// Rough minute equivalent of the monthly credit pool.
    pub estimated_minutes: i64,
    /// Minutes consumed so far this billing period.
    pub minutes_used: i64,
    /// Billing period window.
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,

    // Hard limits (admin-configurable)
    pub max_concurrent_connections: i64,
    pub max_voice_slots: i64,
    pub max_conversation_minutes: i64,
    pub max_daily_minutes_per_user: i64,
    pub max_daily_credits: i64,

    // Alert thresholds, as fractions of the monthly pool.
    pub credit_warning_threshold: f64,
    pub credit_danger_threshold: f64,

    // Feature toggles
    pub enable_hard_limits: bool,
    pub enable_auto_stop: bool,
    pub enable_daily_limits: bool,

    // Maintenance mode
    pub maintenance_mode: bool,
    pub maintenance_message: Option<String>,
    pub maintenance_started_at: Option<DateTime<Utc>>,
    pub maintenance_toggled_by: Option<String>,
}

impl SafetyConfig {
    /// Credits left in the monthly pool. May go negative if the provider
    /// billed more than the pool (the checks treat that as exhausted).
    pub fn remaining_credits(&self) -> i64 {
        self.monthly_credits - self.credits_used
    }

    /// Minute equivalent of the remaining pool.
    pub fn remaining_minutes(&self) -> i64 {
        self.estimated_minutes - self.minutes_used
    }
}
