use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::AdmissionError;
use crate::model::{Ms, now_ms};
use crate::store::RateLimitStore;

/// Fixed-window request budget for one purpose, keyed per client.
///
/// Windows reset rather than slide: a burst straddling a boundary can admit
/// up to twice `max_requests`. Callers accept that in exchange for cheap
/// counters, and some depend on the exact boundary behavior, so keep it.
///
/// Rejections are never retried here; they surface straight to the caller.
pub struct RateLimiter {
    purpose: &'static str,
    config: RateLimitConfig,
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(
        purpose: &'static str,
        config: RateLimitConfig,
        store: Arc<dyn RateLimitStore>,
    ) -> Self {
        Self {
            purpose,
            config,
            store,
        }
    }

    pub fn purpose(&self) -> &'static str {
        self.purpose
    }

    pub async fn check_and_consume(&self, client_key: &str) -> Result<(), AdmissionError> {
        self.check_and_consume_at(client_key, now_ms()).await
    }

    /// Fail without consuming when the window's budget is spent; otherwise
    /// record one consumption. The check and the increment are two store
    /// calls — slight over-admission under contention is fine for a
    /// defensive throttle.
    pub async fn check_and_consume_at(
        &self,
        client_key: &str,
        now: Ms,
    ) -> Result<(), AdmissionError> {
        let key = self.entry_key(client_key);
        let window = self
            .store
            .check_limit(&key, now, self.config.window_ms)
            .await?;
        if window.count >= self.config.max_requests {
            warn!(
                purpose = self.purpose,
                client = client_key,
                count = window.count,
                window_started_at = window.window_started_at,
                "rate limit exceeded"
            );
            metrics::counter!(
                crate::observability::RATE_LIMIT_REJECTIONS_TOTAL,
                "purpose" => self.purpose
            )
            .increment(1);
            return Err(AdmissionError::RateLimitExceeded {
                purpose: self.purpose,
            });
        }
        self.store.increment(&key, now, self.config.window_ms).await
    }

    /// Clear one client's budget (admin override, tests).
    pub async fn reset(&self, client_key: &str) -> Result<(), AdmissionError> {
        self.store.reset(&self.entry_key(client_key)).await
    }

    /// Evict windows that have expired, bounding the store's memory.
    pub async fn cleanup_at(&self, now: Ms) -> Result<usize, AdmissionError> {
        let evicted = self.store.cleanup(now, self.config.window_ms).await?;
        if evicted > 0 {
            debug!(purpose = self.purpose, evicted, "rate limit windows evicted");
            metrics::counter!(crate::observability::RATE_LIMIT_EVICTIONS_TOTAL)
                .increment(evicted as u64);
        }
        Ok(evicted)
    }

    fn entry_key(&self, client_key: &str) -> String {
        format!("{}:{}", self.purpose, client_key)
    }
}
