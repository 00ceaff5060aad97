use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::{month_start, Clock};
use crate::error::Error;
use crate::storage::StoreConnectionInfo;
use crate::usage_limit::{
    BudgetCheck, TokenLedgerMetrics, TokenLedgerMetricsSnapshot, UsageLimitConfig, UsageSummary,
};

/// Durable per-user, per-month token accounting
#[derive(Debug)]
pub struct TokenLedger {
    store: StoreConnectionInfo,
    config: Arc<UsageLimitConfig>,
    clock: Clock,
    metrics: TokenLedgerMetrics,
}

impl TokenLedger {
    pub fn new(store: StoreConnectionInfo, config: Arc<UsageLimitConfig>, clock: Clock) -> Self {
        Self {
            store,
            config,
            clock,
            metrics: TokenLedgerMetrics::default(),
        }
    }

    pub fn config(&self) -> &UsageLimitConfig {
        &self.config
    }

    pub fn monthly_cap(&self) -> u64 {
        self.config.monthly_token_cap
    }

    /// Decide whether `user_id` may spend `estimated_tokens` more this month.
    ///
    /// A first request in a fresh month is always admitted. A projected total at or above the cap
    /// persists the projection and the block flag, which then holds until the month is reset.
    /// A block that cannot be persisted is treated like any other storage failure: with
    /// `fail_open` the request is admitted and the next successful check blocks.
    pub async fn check_budget(
        &self,
        user_id: &str,
        estimated_tokens: u64,
    ) -> Result<BudgetCheck, Error> {
        let cap = self.config.monthly_token_cap;
        let month = self.clock.current_month();

        let (record, created) = match self.store.get_or_create_usage(user_id, &month).await {
            Ok(result) => result,
            Err(e) => {
                if !self.config.fail_open {
                    return Err(e);
                }
                warn!(user_id, %month, "Token budget unavailable, failing open");
                self.metrics.record_fail_open();
                let check = BudgetCheck::allowed(cap.saturating_sub(estimated_tokens), 0);
                self.metrics.record_check(&check);
                return Ok(check);
            }
        };

        let check = if created {
            debug!(user_id, %month, "Created token usage record");
            BudgetCheck::allowed(cap.saturating_sub(estimated_tokens), 0)
        } else if record.is_blocked {
            BudgetCheck::blocked(record.token_count, &self.config.denial_message)
        } else {
            let projected = record.token_count.saturating_add(estimated_tokens);
            if projected >= cap {
                match self.store.block_usage(user_id, &month, projected).await {
                    Ok(()) => {
                        info!(user_id, %month, projected, cap, "Monthly token cap reached");
                        BudgetCheck::blocked(projected, &self.config.denial_message)
                    }
                    Err(e) if self.config.fail_open => {
                        warn!(
                            user_id,
                            %month,
                            projected,
                            "Failed to persist token budget block, failing open: {e}"
                        );
                        self.metrics.record_fail_open();
                        BudgetCheck::allowed(0, record.token_count)
                    }
                    Err(e) => return Err(e),
                }
            } else {
                BudgetCheck::allowed(cap - projected, record.token_count)
            }
        };

        self.metrics.record_check(&check);
        Ok(check)
    }

    /// Add the tokens the provider actually reported. Failures are logged and swallowed.
    pub async fn record_actual_usage(&self, user_id: &str, actual_tokens: u64) {
        let month = self.clock.current_month();
        match self.store.add_usage(user_id, &month, actual_tokens).await {
            Ok(total) => debug!(user_id, %month, actual_tokens, total, "Recorded token usage"),
            Err(e) => {
                self.metrics.record_failure();
                warn!(user_id, %month, actual_tokens, "Failed to record token usage: {e}");
            }
        }
    }

    /// Zero every record of `month` and clear its blocks. Safe to run repeatedly.
    pub async fn reset_for_month(&self, month: &str) -> Result<u64, Error> {
        let reset = self.store.reset_month(month, self.clock.now()).await?;
        info!(month, records = reset, "Reset monthly token usage");
        Ok(reset)
    }

    pub async fn usage_summary(&self, user_id: &str) -> Result<UsageSummary, Error> {
        let now = self.clock.now();
        let month = self.clock.current_month();
        let record = self.store.get_usage(user_id, &month).await?;
        let sessions_this_month = self
            .store
            .count_sessions_since(user_id, month_start(now))
            .await?;

        let cap = self.config.monthly_token_cap;
        let (tokens_used, is_blocked, last_reset_at) = match record {
            Some(record) => (record.token_count, record.is_blocked, record.last_reset_at),
            None => (0, false, None),
        };
        let remaining_tokens = if is_blocked {
            0
        } else {
            cap.saturating_sub(tokens_used)
        };

        Ok(UsageSummary {
            user_id: user_id.to_string(),
            month,
            tokens_used,
            monthly_cap: cap,
            remaining_tokens,
            is_blocked,
            last_reset_at,
            sessions_this_month,
        })
    }

    pub fn metrics(&self) -> TokenLedgerMetricsSnapshot {
        self.metrics.snapshot()
    }
}
