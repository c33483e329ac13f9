use std::sync::Arc;
use std::time::Duration;

use crate::admission::AdmissionCoordinator;
use crate::model::now_ms;

/// Background task that periodically evicts dead rate-limit windows and
/// rewrites overdue transfers so their expiry events go out.
///
/// Correctness never depends on this task: deadlines are re-checked on every
/// touch, so a missed tick costs nothing but delayed notifications.
pub async fn run_sweeper(coordinator: Arc<AdmissionCoordinator>, interval_ms: i64) {
    let period = Duration::from_millis(interval_ms.max(1) as u64);
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(err) = coordinator.sweep_at(now_ms()).await {
            tracing::warn!("sweep pass failed: {err}");
        }
    }
}
