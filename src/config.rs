use std::str::FromStr;

use crate::limits::*;
use crate::model::Ms;

/// Budget for one rate-limit purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: Ms,
}

/// Tunables for the admission core. Defaults come from `limits`; deployments
/// override via `DAYPASS_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_consecutive_days: usize,
    pub default_day_capacity: u32,
    pub transfer_ttl_ms: Ms,
    pub create_limit: RateLimitConfig,
    pub transfer_limit: RateLimitConfig,
    pub sweep_interval_ms: Ms,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_consecutive_days: DEFAULT_MAX_CONSECUTIVE_DAYS,
            default_day_capacity: DEFAULT_DAY_CAPACITY,
            transfer_ttl_ms: DEFAULT_TRANSFER_TTL_MS,
            create_limit: RateLimitConfig {
                max_requests: DEFAULT_CREATE_MAX_REQUESTS,
                window_ms: DEFAULT_CREATE_WINDOW_MS,
            },
            transfer_limit: RateLimitConfig {
                max_requests: DEFAULT_TRANSFER_MAX_REQUESTS,
                window_ms: DEFAULT_TRANSFER_WINDOW_MS,
            },
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl Config {
    /// Read overrides from the environment; anything unset or unparsable
    /// keeps its default.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_consecutive_days: env_parse("DAYPASS_MAX_CONSECUTIVE_DAYS")
                .unwrap_or(d.max_consecutive_days),
            default_day_capacity: env_parse("DAYPASS_DAY_CAPACITY")
                .unwrap_or(d.default_day_capacity),
            transfer_ttl_ms: env_parse("DAYPASS_TRANSFER_TTL_MS").unwrap_or(d.transfer_ttl_ms),
            create_limit: RateLimitConfig {
                max_requests: env_parse("DAYPASS_CREATE_MAX_REQUESTS")
                    .unwrap_or(d.create_limit.max_requests),
                window_ms: env_parse("DAYPASS_CREATE_WINDOW_MS")
                    .unwrap_or(d.create_limit.window_ms),
            },
            transfer_limit: RateLimitConfig {
                max_requests: env_parse("DAYPASS_TRANSFER_MAX_REQUESTS")
                    .unwrap_or(d.transfer_limit.max_requests),
                window_ms: env_parse("DAYPASS_TRANSFER_WINDOW_MS")
                    .unwrap_or(d.transfer_limit.window_ms),
            },
            sweep_interval_ms: env_parse("DAYPASS_SWEEP_INTERVAL_MS")
                .unwrap_or(d.sweep_interval_ms),
        }
    }
}
