//! Monthly token budget per user.
//!
//! The ledger is authoritative: it always reads and writes the durable store, never the session
//! cache. A user whose projected usage reaches the cap is flagged blocked until the month is reset.

pub mod estimate;
pub mod ledger;

pub use estimate::estimate_tokens;
pub use ledger::TokenLedger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, ErrorDetails};

pub const DEFAULT_DENIAL_MESSAGE: &str =
    "Monthly token limit reached. Upgrade to a paid plan to continue.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageLimitConfig {
    #[serde(default = "default_monthly_token_cap")]
    pub monthly_token_cap: u64,

    /// Tokens added to every estimate for the system prompt and injected context
    #[serde(default = "default_prompt_overhead_tokens")]
    pub prompt_overhead_tokens: u64,

    /// Admit requests when the store cannot be read
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,

    #[serde(default = "default_denial_message")]
    pub denial_message: String,
}

fn default_monthly_token_cap() -> u64 {
    650_000
}

fn default_prompt_overhead_tokens() -> u64 {
    150
}

fn default_fail_open() -> bool {
    true
}

fn default_denial_message() -> String {
    DEFAULT_DENIAL_MESSAGE.to_string()
}

impl Default for UsageLimitConfig {
    fn default() -> Self {
        Self {
            monthly_token_cap: default_monthly_token_cap(),
            prompt_overhead_tokens: default_prompt_overhead_tokens(),
            fail_open: default_fail_open(),
            denial_message: default_denial_message(),
        }
    }
}

impl UsageLimitConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.monthly_token_cap == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`usage_limits.monthly_token_cap` must be greater than 0".to_string(),
            }));
        }
        if self.denial_message.trim().is_empty() {
            return Err(Error::new(ErrorDetails::Config {
                message: "`usage_limits.denial_message` must not be empty".to_string(),
            }));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Allowed,
    Blocked,
}

/// Outcome of a budget check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetCheck {
    pub status: BudgetStatus,
    pub remaining_tokens: u64,
    /// Usage for the month as seen by this check, including the estimate when it blocked
    pub total_used: u64,
    /// Human readable reason, set when blocked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BudgetCheck {
    pub fn is_allowed(&self) -> bool {
        self.status == BudgetStatus::Allowed
    }

    fn allowed(remaining_tokens: u64, total_used: u64) -> Self {
        Self {
            status: BudgetStatus::Allowed,
            remaining_tokens,
            total_used,
            message: None,
        }
    }

    fn blocked(total_used: u64, message: &str) -> Self {
        Self {
            status: BudgetStatus::Blocked,
            remaining_tokens: 0,
            total_used,
            message: Some(message.to_string()),
        }
    }
}

/// Per-user view of the current month, for the usage endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub user_id: String,
    pub month: String,
    pub tokens_used: u64,
    pub monthly_cap: u64,
    pub remaining_tokens: u64,
    pub is_blocked: bool,
    pub last_reset_at: Option<DateTime<Utc>>,
    pub sessions_this_month: u64,
}

#[derive(Debug, Default)]
pub struct TokenLedgerMetrics {
    pub checks: AtomicU64,
    pub allowed: AtomicU64,
    pub blocked: AtomicU64,
    pub fail_open_events: AtomicU64,
    pub record_failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenLedgerMetricsSnapshot {
    pub checks: u64,
    pub allowed: u64,
    pub blocked: u64,
    pub fail_open_events: u64,
    pub record_failures: u64,
}

impl TokenLedgerMetrics {
    fn record_check(&self, check: &BudgetCheck) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        match check.status {
            BudgetStatus::Allowed => self.allowed.fetch_add(1, Ordering::Relaxed),
            BudgetStatus::Blocked => self.blocked.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_fail_open(&self) {
        self.fail_open_events.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.record_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TokenLedgerMetricsSnapshot {
        TokenLedgerMetricsSnapshot {
            checks: self.checks.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            fail_open_events: self.fail_open_events.load(Ordering::Relaxed),
            record_failures: self.record_failures.load(Ordering::Relaxed),
        }
    }
}
