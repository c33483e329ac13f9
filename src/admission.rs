use std::sync::Arc;

use tracing::{info, warn};
use ulid::Ulid;

use crate::capacity::CapacityLedger;
use crate::config::Config;
use crate::consecutive;
use crate::error::AdmissionError;
use crate::limits::{MAX_VALID_DAY, MIN_VALID_DAY};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::rate_limit::RateLimiter;
use crate::store::{
    CapacityStore, MemoryRateLimitStore, MemoryStore, RateLimitStore, ReservationStore,
    TransferStore,
};
use crate::transfer::{TransferAction, TransferWorkflow};

pub const PURPOSE_CREATE: &str = "reservation:create";
pub const PURPOSE_TRANSFER: &str = "reservation:transfer";

/// A granted admission: the reservation that was created and the spots left
/// on its day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionReceipt {
    pub reservation_id: Ulid,
    pub day: Day,
    pub remaining_spots: u32,
}

/// The single admission authority: decides whether a booking or transfer is
/// legal right now, and orders the checks so a rejection never mutates
/// anything.
///
/// The identity and client address of each caller come from the external
/// auth collaborator and are trusted, not re-verified.
pub struct AdmissionCoordinator {
    reservations: Arc<dyn ReservationStore>,
    ledger: CapacityLedger,
    transfers: TransferWorkflow,
    create_limiter: RateLimiter,
    transfer_limiter: RateLimiter,
    notify: Arc<NotifyHub>,
    config: Config,
}

impl AdmissionCoordinator {
    pub fn new(
        config: Config,
        reservations: Arc<dyn ReservationStore>,
        capacities: Arc<dyn CapacityStore>,
        transfer_store: Arc<dyn TransferStore>,
        create_rate_store: Arc<dyn RateLimitStore>,
        transfer_rate_store: Arc<dyn RateLimitStore>,
        notify: Arc<NotifyHub>,
    ) -> Self {
        let ledger = CapacityLedger::new(capacities, config.default_day_capacity);
        let transfers = TransferWorkflow::new(
            transfer_store,
            reservations.clone(),
            notify.clone(),
            config.transfer_ttl_ms,
        );
        let create_limiter =
            RateLimiter::new(PURPOSE_CREATE, config.create_limit, create_rate_store);
        let transfer_limiter =
            RateLimiter::new(PURPOSE_TRANSFER, config.transfer_limit, transfer_rate_store);
        Self {
            reservations,
            ledger,
            transfers,
            create_limiter,
            transfer_limiter,
            notify,
            config,
        }
    }

    /// Everything on in-process storage — one admission authority.
    pub fn in_memory(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(
            config,
            store.clone(),
            store.clone(),
            store,
            Arc::new(MemoryRateLimitStore::new()),
            Arc::new(MemoryRateLimitStore::new()),
            Arc::new(NotifyHub::new()),
        )
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn admit(
        &self,
        user: Ulid,
        client_addr: &str,
        day: Day,
        transferable: bool,
    ) -> Result<AdmissionReceipt, AdmissionError> {
        self.admit_at(user, client_addr, day, transferable, now_ms()).await
    }

    /// Create a reservation for `user` on `day`.
    ///
    /// Check order matters: the budget first (reject abusive clients before
    /// touching state), then the side-effect-free consecutive-day rule, and
    /// only then the capacity increment — a booking rejected on the cheap
    /// rule never claims a slot it would immediately give back.
    pub async fn admit_at(
        &self,
        user: Ulid,
        client_addr: &str,
        day: Day,
        transferable: bool,
        now: Ms,
    ) -> Result<AdmissionReceipt, AdmissionError> {
        let started = std::time::Instant::now();
        let result = self
            .admit_inner(user, client_addr, day, transferable, now)
            .await;
        metrics::histogram!(observability::ADMIT_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        match &result {
            Ok(_) => {
                metrics::counter!(observability::ADMISSIONS_TOTAL).increment(1);
            }
            Err(err) => {
                metrics::counter!(
                    observability::ADMISSION_REJECTIONS_TOTAL,
                    "reason" => err.kind()
                )
                .increment(1);
            }
        }
        result
    }

    async fn admit_inner(
        &self,
        user: Ulid,
        client_addr: &str,
        day: Day,
        transferable: bool,
        now: Ms,
    ) -> Result<AdmissionReceipt, AdmissionError> {
        if user.is_nil() {
            return Err(AdmissionError::Authentication);
        }
        if day.0 < MIN_VALID_DAY || day.0 > MAX_VALID_DAY {
            return Err(AdmissionError::Validation("day out of range"));
        }
        self.create_limiter
            .check_and_consume_at(client_addr, now)
            .await?;

        let active_days = self.reservations.active_days_for(user).await?;
        if consecutive::would_exceed(&active_days, day, self.config.max_consecutive_days) {
            info!(user = %user, %day, "admission rejected: consecutive day limit");
            return Err(AdmissionError::Validation("consecutive day limit"));
        }

        let remaining_spots = self.ledger.try_admit(day).await?;

        let reservation = Reservation {
            id: Ulid::new(),
            day,
            primary_user: user,
            status: ReservationStatus::Active,
            transferable,
            created_at: now,
        };
        let reservation_id = reservation.id;
        let state = ReservationState::new(reservation, now);
        if let Err(err) = self.reservations.create_reservation(state).await {
            // the slot was claimed but the booking never landed — give it back
            warn!(reservation = %reservation_id, "admission rollback: {err}");
            let _ = self.ledger.release(day).await;
            return Err(err);
        }

        info!(reservation = %reservation_id, user = %user, %day, remaining_spots, "admitted");
        self.notify.send_to(user, &Event::ReservationAdmitted {
            reservation_id,
            user_id: user,
            day,
            remaining_spots,
        });
        Ok(AdmissionReceipt {
            reservation_id,
            day,
            remaining_spots,
        })
    }

    pub async fn cancel(
        &self,
        user: Ulid,
        reservation_id: Ulid,
    ) -> Result<(), AdmissionError> {
        self.cancel_at(user, reservation_id, now_ms()).await
    }

    /// The inverse of admission: mark the rows cancelled, then free the
    /// day's slot.
    pub async fn cancel_at(
        &self,
        user: Ulid,
        reservation_id: Ulid,
        now: Ms,
    ) -> Result<(), AdmissionError> {
        if user.is_nil() {
            return Err(AdmissionError::Authentication);
        }
        let state = self
            .reservations
            .get_reservation(reservation_id)
            .await?
            .ok_or(AdmissionError::Validation("unknown reservation"))?;
        if state.reservation.primary_user != user {
            return Err(AdmissionError::Authorization(
                "only the primary occupant may cancel",
            ));
        }
        let day = self.reservations.cancel_reservation(reservation_id, now).await?;
        self.ledger.release(day).await?;
        info!(reservation = %reservation_id, user = %user, %day, "cancelled");
        self.notify.send_to(user, &Event::ReservationCancelled {
            reservation_id,
            user_id: user,
            day,
        });
        Ok(())
    }

    pub async fn add_occupant(
        &self,
        owner: Ulid,
        client_addr: &str,
        reservation_id: Ulid,
        guest: Ulid,
    ) -> Result<(), AdmissionError> {
        self.add_occupant_at(owner, client_addr, reservation_id, guest, now_ms())
            .await
    }

    /// Attach `guest` as an additional occupant of the owner's reservation.
    ///
    /// The guest's own consecutive-day run is checked: occupancy counts
    /// toward the limit whether it came from a booking or an invitation.
    /// Additional occupants consume no capacity — the day's counter tracks
    /// reservations, not people.
    pub async fn add_occupant_at(
        &self,
        owner: Ulid,
        client_addr: &str,
        reservation_id: Ulid,
        guest: Ulid,
        now: Ms,
    ) -> Result<(), AdmissionError> {
        if owner.is_nil() {
            return Err(AdmissionError::Authentication);
        }
        if guest.is_nil() || guest == owner {
            return Err(AdmissionError::Validation("invalid guest"));
        }
        self.create_limiter
            .check_and_consume_at(client_addr, now)
            .await?;
        let state = self
            .reservations
            .get_reservation(reservation_id)
            .await?
            .ok_or(AdmissionError::Validation("unknown reservation"))?;
        if state.reservation.primary_user != owner {
            return Err(AdmissionError::Authorization(
                "only the primary occupant may add guests",
            ));
        }
        let day = state.reservation.day;
        let guest_days = self.reservations.active_days_for(guest).await?;
        if consecutive::would_exceed(&guest_days, day, self.config.max_consecutive_days) {
            info!(user = %guest, %day, "guest rejected: consecutive day limit");
            return Err(AdmissionError::Validation("consecutive day limit"));
        }
        self.reservations
            .add_occupant(reservation_id, guest, now)
            .await?;
        info!(reservation = %reservation_id, user = %guest, %day, "occupant added");
        self.notify.send_to(guest, &Event::OccupantAdded {
            reservation_id,
            user_id: guest,
            day,
        });
        Ok(())
    }

    /// Spots still open on `day`, for display.
    pub async fn remaining_spots(&self, day: Day) -> Result<u32, AdmissionError> {
        self.ledger.remaining(day).await
    }

    /// Administrative override of one day's maximum capacity.
    pub async fn set_day_capacity(&self, day: Day, max: u32) -> Result<(), AdmissionError> {
        if day.0 < MIN_VALID_DAY || day.0 > MAX_VALID_DAY {
            return Err(AdmissionError::Validation("day out of range"));
        }
        self.ledger.set_max(day, max).await
    }

    // ── transfer surface, budgeted separately ────────────────

    pub async fn request_transfer(
        &self,
        initiator: Ulid,
        client_addr: &str,
        reservation_id: Ulid,
        target: Ulid,
    ) -> Result<TransferRequest, AdmissionError> {
        self.request_transfer_at(initiator, client_addr, reservation_id, target, now_ms())
            .await
    }

    pub async fn request_transfer_at(
        &self,
        initiator: Ulid,
        client_addr: &str,
        reservation_id: Ulid,
        target: Ulid,
        now: Ms,
    ) -> Result<TransferRequest, AdmissionError> {
        if initiator.is_nil() {
            return Err(AdmissionError::Authentication);
        }
        self.transfer_limiter
            .check_and_consume_at(client_addr, now)
            .await?;
        self.transfers
            .create_at(reservation_id, initiator, target, now)
            .await
    }

    pub async fn respond_transfer(
        &self,
        acting_user: Ulid,
        client_addr: &str,
        transfer_id: Ulid,
        action: TransferAction,
    ) -> Result<TransferRequest, AdmissionError> {
        self.respond_transfer_at(acting_user, client_addr, transfer_id, action, now_ms())
            .await
    }

    pub async fn respond_transfer_at(
        &self,
        acting_user: Ulid,
        client_addr: &str,
        transfer_id: Ulid,
        action: TransferAction,
        now: Ms,
    ) -> Result<TransferRequest, AdmissionError> {
        if acting_user.is_nil() {
            return Err(AdmissionError::Authentication);
        }
        self.transfer_limiter
            .check_and_consume_at(client_addr, now)
            .await?;
        self.transfers
            .respond_at(transfer_id, acting_user, action, now)
            .await
    }

    pub async fn pending_transfers_for(
        &self,
        user: Ulid,
    ) -> Result<Vec<TransferRequest>, AdmissionError> {
        self.transfers.pending_for(user).await
    }

    pub async fn pending_transfers_for_at(
        &self,
        user: Ulid,
        now: Ms,
    ) -> Result<Vec<TransferRequest>, AdmissionError> {
        self.transfers.pending_for_at(user, now).await
    }

    /// One maintenance pass: evict dead rate-limit windows and rewrite
    /// overdue transfers. The sweeper task calls this on an interval.
    pub async fn sweep_at(&self, now: Ms) -> Result<(), AdmissionError> {
        self.create_limiter.cleanup_at(now).await?;
        self.transfer_limiter.cleanup_at(now).await?;
        self.transfers.expire_overdue_at(now).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> AdmissionCoordinator {
        AdmissionCoordinator::in_memory(Config::default())
    }

    #[tokio::test]
    async fn admit_rejects_missing_identity() {
        let c = coordinator();
        let err = c
            .admit_at(Ulid::nil(), "10.0.0.1", Day(19_000), true, 0)
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Authentication);
    }

    #[tokio::test]
    async fn admit_rejects_out_of_range_day() {
        let c = coordinator();
        let err = c
            .admit_at(Ulid::new(), "10.0.0.1", Day(-5), true, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[tokio::test]
    async fn fourth_consecutive_day_is_rejected_before_capacity() {
        let c = coordinator();
        let user = Ulid::new();
        for (i, day) in [Day(100), Day(101), Day(102)].into_iter().enumerate() {
            c.admit_at(user, "10.0.0.1", day, true, i as Ms).await.unwrap();
        }
        let err = c
            .admit_at(user, "10.0.0.1", Day(103), true, 10)
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Validation("consecutive day limit"));
        // the rejected booking consumed no capacity
        assert_eq!(
            c.remaining_spots(Day(103)).await.unwrap(),
            Config::default().default_day_capacity
        );
    }

    #[tokio::test]
    async fn cancelled_days_no_longer_count_toward_the_run() {
        let c = coordinator();
        let user = Ulid::new();
        let receipt = c.admit_at(user, "10.0.0.1", Day(200), true, 0).await.unwrap();
        c.admit_at(user, "10.0.0.1", Day(201), true, 1).await.unwrap();
        c.admit_at(user, "10.0.0.1", Day(202), true, 2).await.unwrap();
        c.cancel_at(user, receipt.reservation_id, 3).await.unwrap();
        // with day 200 gone the run would be 201-203, length 3
        c.admit_at(user, "10.0.0.1", Day(203), true, 4).await.unwrap();
    }

    #[tokio::test]
    async fn create_budget_is_per_client() {
        let c = coordinator();
        // distinct users, same client address: the 6th request in the
        // window is refused whoever it is for
        for i in 0..5 {
            c.admit_at(Ulid::new(), "10.9.9.9", Day(300 + i), true, 1_000)
                .await
                .unwrap();
        }
        let err = c
            .admit_at(Ulid::new(), "10.9.9.9", Day(390), true, 1_000)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AdmissionError::RateLimitExceeded {
                purpose: PURPOSE_CREATE
            }
        );
        // another client is unaffected
        c.admit_at(Ulid::new(), "10.9.9.8", Day(391), true, 1_000)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_requires_the_primary() {
        let c = coordinator();
        let owner = Ulid::new();
        let receipt = c
            .admit_at(owner, "10.0.0.1", Day(400), true, 0)
            .await
            .unwrap();
        let err = c
            .cancel_at(Ulid::new(), receipt.reservation_id, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Authorization(_)));
        c.cancel_at(owner, receipt.reservation_id, 2).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_frees_the_capacity_slot() {
        let mut config = Config::default();
        config.default_day_capacity = 1;
        let c = AdmissionCoordinator::in_memory(config);
        let owner = Ulid::new();
        let receipt = c.admit_at(owner, "a", Day(500), true, 0).await.unwrap();
        assert!(matches!(
            c.admit_at(Ulid::new(), "b", Day(500), true, 1).await.unwrap_err(),
            AdmissionError::CapacityExceeded { .. }
        ));
        c.cancel_at(owner, receipt.reservation_id, 2).await.unwrap();
        c.admit_at(Ulid::new(), "b", Day(500), true, 3).await.unwrap();
    }

    #[tokio::test]
    async fn add_occupant_checks_owner_and_guest_run() {
        let c = coordinator();
        let owner = Ulid::new();
        let guest = Ulid::new();
        let receipt = c.admit_at(owner, "10.0.0.1", Day(600), true, 0).await.unwrap();

        // only the primary may invite
        let err = c
            .add_occupant_at(guest, "10.0.0.2", receipt.reservation_id, Ulid::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Authorization(_)));

        c.add_occupant_at(owner, "10.0.0.1", receipt.reservation_id, guest, 2)
            .await
            .unwrap();

        // the invitation counts toward the guest's consecutive run
        let guest_client = "10.0.0.3";
        c.admit_at(guest, guest_client, Day(601), true, 3).await.unwrap();
        c.admit_at(guest, guest_client, Day(602), true, 4).await.unwrap();
        let err = c
            .admit_at(guest, guest_client, Day(603), true, 5)
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Validation("consecutive day limit"));

        // and the inverse: a guest with a full run cannot be invited either
        let owner2 = Ulid::new();
        let receipt2 = c.admit_at(owner2, "10.0.0.4", Day(599), true, 6).await.unwrap();
        let err = c
            .add_occupant_at(owner2, "10.0.0.4", receipt2.reservation_id, guest, 7)
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Validation("consecutive day limit"));
    }

    #[tokio::test]
    async fn transfer_surface_checks_identity_and_budget() {
        let c = coordinator();
        let err = c
            .request_transfer_at(Ulid::nil(), "x", Ulid::new(), Ulid::new(), 0)
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Authentication);

        let max = Config::default().transfer_limit.max_requests;
        let user = Ulid::new();
        for _ in 0..max {
            // every attempt fails validation (unknown reservation) but the
            // budget is spent before the workflow ever runs
            let err = c
                .request_transfer_at(user, "10.1.1.1", Ulid::new(), Ulid::new(), 0)
                .await
                .unwrap_err();
            assert!(matches!(err, AdmissionError::Validation(_)));
        }
        let err = c
            .request_transfer_at(user, "10.1.1.1", Ulid::new(), Ulid::new(), 0)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AdmissionError::RateLimitExceeded {
                purpose: PURPOSE_TRANSFER
            }
        );
    }

    #[tokio::test]
    async fn sweep_passes_are_idempotent() {
        let c = coordinator();
        c.sweep_at(0).await.unwrap();
        c.sweep_at(1_000_000).await.unwrap();
    }
}
