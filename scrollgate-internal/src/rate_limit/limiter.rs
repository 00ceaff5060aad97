use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::rate_limit::{
    config::{EndpointClass, EndpointLimit, RateLimitConfig},
    RateLimitDecision, RateLimitHeaders, RateLimiterMetrics, RateLimiterMetricsSnapshot,
};

type WindowKey = (String, EndpointClass);

/// Fixed window counter plus the admission times still inside the burst sub-window.
#[derive(Debug, Clone)]
struct RateWindow {
    count: u32,
    reset_at_ms: i64,
    /// Admission timestamps, oldest first. Entries older than the burst window are dropped on read.
    burst: VecDeque<i64>,
}

impl RateWindow {
    fn fresh(now_ms: i64, limit: &EndpointLimit, burst: VecDeque<i64>) -> Self {
        Self {
            count: 0,
            reset_at_ms: now_ms.saturating_add(window_ms(limit.window_ms)),
            burst,
        }
    }

    fn decay_burst(&mut self, now_ms: i64, burst_window_ms: u64) {
        let horizon = now_ms.saturating_sub(window_ms(burst_window_ms));
        while self.burst.front().is_some_and(|admitted| *admitted <= horizon) {
            self.burst.pop_front();
        }
    }

    fn headers(&self, limit: &EndpointLimit, retry_after: Option<u64>) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: limit.max_requests,
            remaining: limit.max_requests.saturating_sub(self.count),
            reset_at_ms: self.reset_at_ms,
            retry_after,
        }
    }
}

fn window_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

/// Whole seconds until `until_ms`, never less than one.
fn seconds_until(now_ms: i64, until_ms: i64) -> u64 {
    let millis = u64::try_from(until_ms.saturating_sub(now_ms)).unwrap_or(0);
    millis.div_ceil(1000).max(1)
}

/// In-process admission control keyed by client identifier and endpoint class.
///
/// State lives for the lifetime of the process and is lost on restart.
pub struct RateLimiter {
    windows: Arc<DashMap<WindowKey, RateWindow>>,
    config: Arc<RateLimitConfig>,
    clock: Clock,
    metrics: Arc<RateLimiterMetrics>,
    sweeper_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("tracked_windows", &self.windows.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(config: Arc<RateLimitConfig>, clock: Clock) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            config,
            clock,
            metrics: Arc::new(RateLimiterMetrics::default()),
            sweeper_handle: Arc::new(RwLock::new(None)),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit or reject one request for `identifier` on `class`.
    ///
    /// Admission increments both the window count and the burst counter. A rejection leaves
    /// both untouched.
    pub fn check_limit(&self, identifier: &str, class: EndpointClass) -> RateLimitDecision {
        let limit = self.config.limit_for(class);
        let now = self.clock.now_millis();

        if !self.config.enabled {
            return RateLimitDecision::Allow(RateLimitHeaders {
                limit: limit.max_requests,
                remaining: limit.max_requests,
                reset_at_ms: now.saturating_add(window_ms(limit.window_ms)),
                retry_after: None,
            });
        }

        // The entry guard holds the shard lock, so check and increment are atomic per key.
        let mut entry = self
            .windows
            .entry((identifier.to_string(), class))
            .or_insert_with(|| RateWindow::fresh(now, limit, VecDeque::new()));
        let window = entry.value_mut();

        if now >= window.reset_at_ms {
            let burst = std::mem::take(&mut window.burst);
            *window = RateWindow::fresh(now, limit, burst);
        }
        window.decay_burst(now, limit.burst_window_ms);

        if window.count >= limit.max_requests {
            self.metrics.record_rejected_window();
            let retry_after = seconds_until(now, window.reset_at_ms);
            debug!(identifier, %class, retry_after, "Rate limit window exhausted");
            return RateLimitDecision::Deny(window.headers(limit, Some(retry_after)));
        }

        let burst_limit = usize::try_from(limit.burst_limit).unwrap_or(usize::MAX);
        if window.burst.len() >= burst_limit {
            self.metrics.record_rejected_burst();
            let relaxes_at = window
                .burst
                .front()
                .map(|oldest| oldest.saturating_add(window_ms(limit.burst_window_ms)))
                .unwrap_or(now);
            let retry_after = seconds_until(now, relaxes_at);
            debug!(identifier, %class, retry_after, "Burst ceiling reached");
            return RateLimitDecision::Deny(window.headers(limit, Some(retry_after)));
        }

        window.count += 1;
        window.burst.push_back(now);
        self.metrics.record_allowed();
        RateLimitDecision::Allow(window.headers(limit, None))
    }

    /// Drop every window whose reset time has passed and whose burst slots have all relaxed.
    /// Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        purge_expired_windows(&self.windows, &self.config, &self.clock, &self.metrics)
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn metrics(&self) -> RateLimiterMetricsSnapshot {
        self.metrics.snapshot(self.windows.len())
    }

    /// Start the periodic sweep of expired windows
    pub async fn start_sweeper(&self) {
        let windows = Arc::clone(&self.windows);
        let metrics = Arc::clone(&self.metrics);
        let config = Arc::clone(&self.config);
        let clock = self.clock.clone();
        let period = Duration::from_millis(self.config.sweep_interval_ms);

        let handle = tokio::spawn(async move {
            let mut sweep_interval = interval(period);
            sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            sweep_interval.tick().await;

            loop {
                sweep_interval.tick().await;
                let purged = purge_expired_windows(&windows, &config, &clock, &metrics);
                if purged > 0 {
                    debug!(purged, "Purged expired rate limit windows");
                }
            }
        });

        if let Some(previous) = self.sweeper_handle.write().await.replace(handle) {
            previous.abort();
        }
        info!(
            interval_ms = self.config.sweep_interval_ms,
            "Started rate limit sweeper"
        );
    }

    /// Stop the periodic sweep
    pub async fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper_handle.write().await.take() {
            handle.abort();
        }
    }

    pub async fn sweeper_running(&self) -> bool {
        self.sweeper_handle
            .read()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

fn purge_expired_windows(
    windows: &DashMap<WindowKey, RateWindow>,
    config: &RateLimitConfig,
    clock: &Clock,
    metrics: &RateLimiterMetrics,
) -> usize {
    let now = clock.now_millis();
    let before = windows.len();
    // Burst slots outlive the window they were admitted in
    windows.retain(|(_, class), window| {
        let burst_window = window_ms(config.limit_for(*class).burst_window_ms);
        window.reset_at_ms > now
            || window
                .burst
                .back()
                .is_some_and(|admitted| admitted.saturating_add(burst_window) > now)
    });
    let purged = before.saturating_sub(windows.len());
    metrics.record_purged(u64::try_from(purged).unwrap_or(u64::MAX));
    purged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn limiter_with(limit: EndpointLimit) -> (RateLimiter, Clock) {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap());
        let config = RateLimitConfig {
            high_cost: limit,
            ..Default::default()
        };
        (RateLimiter::new(Arc::new(config), clock.clone()), clock)
    }

    #[test]
    fn test_window_rejects_after_max_requests() {
        // Burst window shorter than the spacing so only the main window matters
        let (limiter, clock) = limiter_with(EndpointLimit {
            max_requests: 3,
            window_ms: 60_000,
            burst_limit: 10,
            burst_window_ms: 1_000,
        });

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_limit("user-1", EndpointClass::HighCost);
            assert!(decision.is_allowed());
            assert_eq!(decision.headers().remaining, expected_remaining);
            clock.advance(Duration::from_secs(2));
        }

        let decision = limiter.check_limit("user-1", EndpointClass::HighCost);
        assert!(!decision.is_allowed());
        assert_eq!(decision.headers().remaining, 0);
        assert_eq!(decision.headers().limit, 3);
        // Window opened at t=0 and we are at t=6s
        assert_eq!(decision.headers().retry_after, Some(54));
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let (limiter, clock) = limiter_with(EndpointLimit {
            max_requests: 2,
            window_ms: 10_000,
            burst_limit: 10,
            burst_window_ms: 5_000,
        });

        assert!(limiter.check_limit("k", EndpointClass::HighCost).is_allowed());
        assert!(limiter.check_limit("k", EndpointClass::HighCost).is_allowed());
        let denied = limiter.check_limit("k", EndpointClass::HighCost);
        assert!(!denied.is_allowed());
        let reset_at = denied.headers().reset_at_ms;

        clock.set(chrono::DateTime::from_timestamp_millis(reset_at).unwrap());
        let decision = limiter.check_limit("k", EndpointClass::HighCost);
        assert!(decision.is_allowed());
        // Counter restarted at 1
        assert_eq!(decision.headers().remaining, 1);
        assert_eq!(decision.headers().reset_at_ms, reset_at + 10_000);
    }

    #[test]
    fn test_burst_ceiling_independent_of_window() {
        let (limiter, clock) = limiter_with(EndpointClass::HighCost.default_limit());

        for _ in 0..5 {
            assert!(limiter.check_limit("u", EndpointClass::HighCost).is_allowed());
        }
        let denied = limiter.check_limit("u", EndpointClass::HighCost);
        assert!(!denied.is_allowed());
        // The main window still has headroom
        assert_eq!(denied.headers().remaining, 25);
        assert_eq!(denied.headers().retry_after, Some(5));

        clock.advance(Duration::from_millis(5_000));
        let decision = limiter.check_limit("u", EndpointClass::HighCost);
        assert!(decision.is_allowed());
        assert_eq!(decision.headers().remaining, 24);
    }

    #[test]
    fn test_burst_relaxes_slot_by_slot() {
        let (limiter, clock) = limiter_with(EndpointLimit::new(100, 60_000, 2));

        assert!(limiter.check_limit("u", EndpointClass::HighCost).is_allowed());
        clock.advance(Duration::from_secs(3));
        assert!(limiter.check_limit("u", EndpointClass::HighCost).is_allowed());
        assert!(!limiter.check_limit("u", EndpointClass::HighCost).is_allowed());

        // First slot (t=0) relaxes at t=5, second (t=3) still held
        clock.advance(Duration::from_secs(2));
        assert!(limiter.check_limit("u", EndpointClass::HighCost).is_allowed());
        assert!(!limiter.check_limit("u", EndpointClass::HighCost).is_allowed());
    }

    #[test]
    fn test_rejection_has_no_side_effect() {
        let (limiter, clock) = limiter_with(EndpointLimit::new(100, 60_000, 1));

        assert!(limiter.check_limit("u", EndpointClass::HighCost).is_allowed());
        for _ in 0..10 {
            assert!(!limiter.check_limit("u", EndpointClass::HighCost).is_allowed());
        }
        clock.advance(Duration::from_secs(5));
        let decision = limiter.check_limit("u", EndpointClass::HighCost);
        assert!(decision.is_allowed());
        // Only the two admitted requests were counted
        assert_eq!(decision.headers().remaining, 98);
    }

    #[test]
    fn test_keys_are_isolated() {
        let (limiter, _clock) = limiter_with(EndpointLimit::new(1, 60_000, 1));

        assert!(limiter.check_limit("a", EndpointClass::HighCost).is_allowed());
        assert!(!limiter.check_limit("a", EndpointClass::HighCost).is_allowed());
        assert!(limiter.check_limit("b", EndpointClass::HighCost).is_allowed());
        assert!(limiter.check_limit("a", EndpointClass::Default).is_allowed());
    }

    #[test]
    fn test_disabled_limiter_admits_everything() {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap());
        let config = RateLimitConfig {
            enabled: false,
            ..Default::default()
        };
        let limiter = RateLimiter::new(Arc::new(config), clock);
        for _ in 0..50 {
            assert!(limiter.check_limit("u", EndpointClass::Auth).is_allowed());
        }
        assert_eq!(limiter.tracked_windows(), 0);
    }

    #[test]
    fn test_purge_expired_drops_only_stale_windows() {
        let (limiter, clock) = limiter_with(EndpointLimit::new(10, 10_000, 5));

        limiter.check_limit("old", EndpointClass::HighCost);
        clock.advance(Duration::from_secs(6));
        limiter.check_limit("new", EndpointClass::HighCost);
        clock.advance(Duration::from_secs(5));

        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.tracked_windows(), 1);
        let metrics = limiter.metrics();
        assert_eq!(metrics.purged_windows, 1);
        assert_eq!(metrics.allowed, 2);
    }

    #[test]
    fn test_purge_keeps_live_burst_slots_across_window_reset() {
        let (limiter, clock) = limiter_with(EndpointClass::HighCost.default_limit());

        // Opens the window at t=0, so it expires at t=60s
        assert!(limiter.check_limit("u", EndpointClass::HighCost).is_allowed());
        clock.advance(Duration::from_secs(59));
        for _ in 0..5 {
            assert!(limiter.check_limit("u", EndpointClass::HighCost).is_allowed());
        }

        // The window has expired but the burst slots from t=59s hold until t=64s
        clock.advance(Duration::from_millis(1_500));
        assert_eq!(limiter.purge_expired(), 0);
        assert_eq!(limiter.tracked_windows(), 1);
        assert!(!limiter.check_limit("u", EndpointClass::HighCost).is_allowed());
        assert_eq!(limiter.metrics().rejected_burst, 1);

        clock.advance(Duration::from_secs(4));
        assert!(limiter.check_limit("u", EndpointClass::HighCost).is_allowed());
    }

    #[test]
    fn test_purge_drops_window_once_burst_relaxed() {
        let (limiter, clock) = limiter_with(EndpointLimit::new(10, 10_000, 5));

        limiter.check_limit("u", EndpointClass::HighCost);
        clock.advance(Duration::from_secs(9));
        limiter.check_limit("u", EndpointClass::HighCost);

        // Window expired at t=10s, last burst slot relaxes at t=14s
        clock.advance(Duration::from_secs(2));
        assert_eq!(limiter.purge_expired(), 0);
        clock.advance(Duration::from_secs(3));
        assert_eq!(limiter.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_purges_on_interval() {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap());
        let config = RateLimitConfig {
            sweep_interval_ms: 20,
            high_cost: EndpointLimit::new(10, 500, 5),
            ..Default::default()
        };
        let limiter = RateLimiter::new(Arc::new(config), clock.clone());
        limiter.check_limit("u", EndpointClass::HighCost);
        limiter.start_sweeper().await;
        assert!(limiter.sweeper_running().await);

        // Past both the window and the burst slot
        clock.advance(Duration::from_secs(6));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(limiter.tracked_windows(), 0);

        limiter.stop_sweeper().await;
        assert!(!limiter.sweeper_running().await);
    }
}
