use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

/// Named category of request, each with its own limits
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EndpointClass {
    /// Requests that reach the upstream model
    HighCost,
    Default,
    /// Authentication and administrative requests
    Auth,
}

/// Limits for one endpoint class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointLimit {
    /// Requests admitted per fixed window
    pub max_requests: u32,
    pub window_ms: u64,
    /// Requests admitted within the trailing burst sub-window
    pub burst_limit: u32,
    #[serde(default = "default_burst_window_ms")]
    pub burst_window_ms: u64,
}

fn default_burst_window_ms() -> u64 {
    5_000
}

impl EndpointLimit {
    pub const fn new(max_requests: u32, window_ms: u64, burst_limit: u32) -> Self {
        Self {
            max_requests,
            window_ms,
            burst_limit,
            burst_window_ms: 5_000,
        }
    }
}

impl EndpointClass {
    pub const fn default_limit(self) -> EndpointLimit {
        match self {
            EndpointClass::HighCost => EndpointLimit::new(30, 60_000, 5),
            EndpointClass::Default => EndpointLimit::new(100, 60_000, 10),
            EndpointClass::Auth => EndpointLimit::new(10, 300_000, 3),
        }
    }
}

/// Configuration for rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Interval between sweeps of expired windows, in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    #[serde(default = "default_high_cost")]
    pub high_cost: EndpointLimit,

    #[serde(default = "default_default")]
    pub default: EndpointLimit,

    #[serde(default = "default_auth")]
    pub auth: EndpointLimit,
}

fn default_enabled() -> bool {
    true
}

fn default_sweep_interval_ms() -> u64 {
    300_000
}

fn default_high_cost() -> EndpointLimit {
    EndpointClass::HighCost.default_limit()
}

fn default_default() -> EndpointLimit {
    EndpointClass::Default.default_limit()
}

fn default_auth() -> EndpointLimit {
    EndpointClass::Auth.default_limit()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            sweep_interval_ms: default_sweep_interval_ms(),
            high_cost: default_high_cost(),
            default: default_default(),
            auth: default_auth(),
        }
    }
}

impl RateLimitConfig {
    pub fn limit_for(&self, class: EndpointClass) -> &EndpointLimit {
        match class {
            EndpointClass::HighCost => &self.high_cost,
            EndpointClass::Default => &self.default,
            EndpointClass::Auth => &self.auth,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.sweep_interval_ms == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`rate_limits.sweep_interval_ms` must be greater than 0".to_string(),
            }));
        }
        for class in <EndpointClass as strum::IntoEnumIterator>::iter() {
            let limit = self.limit_for(class);
            if limit.max_requests == 0
                || limit.window_ms == 0
                || limit.burst_limit == 0
                || limit.burst_window_ms == 0
            {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!(
                        "`rate_limits.{class}` limits and windows must all be greater than 0"
                    ),
                }));
            }
        }
        Ok(())
    }
}
