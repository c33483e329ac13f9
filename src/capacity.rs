use std::sync::Arc;

use crate::error::AdmissionError;
use crate::model::Day;
use crate::store::CapacityStore;

/// Per-day booking counters against a configured maximum.
///
/// Admission is a single conditional check-and-increment in the store, so
/// two concurrent bookings for the same day cannot both take the last spot.
/// Distinct days never contend.
pub struct CapacityLedger {
    store: Arc<dyn CapacityStore>,
    default_max: u32,
}

impl CapacityLedger {
    pub fn new(store: Arc<dyn CapacityStore>, default_max: u32) -> Self {
        Self { store, default_max }
    }

    /// Claim one spot on `day`. Returns the spots remaining afterwards, or
    /// `CapacityExceeded` with nothing mutated.
    pub async fn try_admit(&self, day: Day) -> Result<u32, AdmissionError> {
        self.store.try_admit(day, self.default_max).await
    }

    /// Give one spot back (cancellation). Floored at zero in the store.
    pub async fn release(&self, day: Day) -> Result<(), AdmissionError> {
        self.store.release(day).await
    }

    /// Spots still open on `day`, for display. An unconfigured day reports
    /// the full default capacity.
    pub async fn remaining(&self, day: Day) -> Result<u32, AdmissionError> {
        Ok(self
            .store
            .get_capacity(day)
            .await?
            .map(|cap| cap.remaining())
            .unwrap_or(self.default_max))
    }

    /// Override one day's maximum (seasonal closures, extra staffing).
    pub async fn set_max(&self, day: Day, max: u32) -> Result<(), AdmissionError> {
        self.store.set_max_capacity(day, max).await
    }
}
