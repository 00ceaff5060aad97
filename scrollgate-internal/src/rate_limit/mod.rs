pub mod config;
pub mod limiter;
pub mod middleware;


pub use config::{EndpointClass, EndpointLimit, RateLimitConfig};
pub use limiter::RateLimiter;
pub use middleware::{client_identifier, rate_limit_middleware, RateLimitLayerState};

use axum::http::{HeaderMap, HeaderValue};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Headers returned with rate limit information
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    /// Total requests allowed in the window
    pub limit: u32,
    pub remaining: u32,
    /// Window expiry, unix milliseconds
    pub reset_at_ms: i64,
    /// Seconds until a rejected request may be retried
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    /// Window expiry rounded up to whole unix seconds
    pub fn reset_secs(&self) -> i64 {
        (self.reset_at_ms + 999).div_euclid(1000)
    }

    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset_secs()));

        if let Some(retry_after) = self.retry_after {
            headers.insert("retry-after", HeaderValue::from(retry_after));
        }

        headers
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allow(RateLimitHeaders),
    Deny(RateLimitHeaders),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow(_))
    }

    pub fn headers(&self) -> &RateLimitHeaders {
        match self {
            RateLimitDecision::Allow(h) | RateLimitDecision::Deny(h) => h,
        }
    }

    pub fn into_headers(self) -> RateLimitHeaders {
        match self {
            RateLimitDecision::Allow(h) | RateLimitDecision::Deny(h) => h,
        }
    }
}

/// Metrics for rate limiter monitoring
#[derive(Debug, Default)]
pub struct RateLimiterMetrics {
    pub allowed: AtomicU64,
    pub rejected_window: AtomicU64,
    pub rejected_burst: AtomicU64,
    pub purged_windows: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimiterMetricsSnapshot {
    pub allowed: u64,
    pub rejected_window: u64,
    pub rejected_burst: u64,
    pub purged_windows: u64,
    pub tracked_windows: usize,
}

impl RateLimiterMetrics {
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_window(&self) {
        self.rejected_window.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_burst(&self) {
        self.rejected_burst.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_purged(&self, count: u64) {
        self.purged_windows.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self, tracked_windows: usize) -> RateLimiterMetricsSnapshot {
        RateLimiterMetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            rejected_window: self.rejected_window.load(Ordering::Relaxed),
            rejected_burst: self.rejected_burst.load(Ordering::Relaxed),
            purged_windows: self.purged_windows.load(Ordering::Relaxed),
            tracked_windows,
        }
    }
}
