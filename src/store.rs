//! Storage capabilities consumed by the admission core.
//!
//! The traits describe what the backing store must be able to do — point
//! reads, conditional updates, and a few multi-row commits. `MemoryStore`
//! is the single-process provider: DashMap rows behind per-row `RwLock`s,
//! which gives every conditional update a natural serialization point. A
//! shared backing store can replace it without touching any call site.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::error::AdmissionError;
use crate::limits::*;
use crate::model::*;

pub type SharedReservation = Arc<RwLock<ReservationState>>;

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Persist a new reservation together with its primary occupant row in
    /// one commit.
    async fn create_reservation(&self, state: ReservationState) -> Result<(), AdmissionError>;

    /// Snapshot of a reservation and its occupant rows.
    async fn get_reservation(&self, id: Ulid)
    -> Result<Option<ReservationState>, AdmissionError>;

    /// Days on which the user holds an ACTIVE occupant row of an ACTIVE
    /// reservation — the input to the consecutive-day check.
    async fn active_days_for(&self, user: Ulid) -> Result<Vec<Day>, AdmissionError>;

    async fn is_active_occupant(
        &self,
        reservation_id: Ulid,
        user: Ulid,
    ) -> Result<bool, AdmissionError>;

    /// Attach `user` as an additional ACTIVE occupant, reactivating a
    /// cancelled row when one exists. Conditional on the reservation being
    /// ACTIVE and the user not already holding an active slot.
    async fn add_occupant(
        &self,
        reservation_id: Ulid,
        user: Ulid,
        now: Ms,
    ) -> Result<(), AdmissionError>;

    /// Cancel the reservation and cascade its occupant rows. Returns the
    /// freed day so the caller can release the capacity slot.
    async fn cancel_reservation(&self, id: Ulid, now: Ms) -> Result<Day, AdmissionError>;
}

#[async_trait]
pub trait CapacityStore: Send + Sync {
    /// Atomic check-and-increment for one day. Concurrent admissions for the
    /// same day serialize; a full day fails with `CapacityExceeded` and no
    /// mutation. A missing row is created lazily with `default_max`, never
    /// failed. Returns the spots remaining after this admission.
    async fn try_admit(&self, day: Day, default_max: u32) -> Result<u32, AdmissionError>;

    /// Decrement the day's counter, floored at zero (double release is a
    /// no-op, not an underflow).
    async fn release(&self, day: Day) -> Result<(), AdmissionError>;

    async fn get_capacity(&self, day: Day) -> Result<Option<DateCapacity>, AdmissionError>;

    /// Set one day's maximum, creating the row if needed. Existing bookings
    /// are kept; lowering the maximum below them is refused so the counter
    /// invariant cannot break.
    async fn set_max_capacity(&self, day: Day, max: u32) -> Result<(), AdmissionError>;
}

#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Insert a PENDING transfer, enforcing at most one live PENDING row per
    /// (reservation, target) pair.
    async fn insert_pending(&self, transfer: TransferRequest) -> Result<(), AdmissionError>;

    async fn get_transfer(&self, id: Ulid) -> Result<Option<TransferRequest>, AdmissionError>;

    /// Compare-and-swap PENDING → terminal state. The losing side of a
    /// concurrent race observes `Conflict`.
    async fn finish_transfer(
        &self,
        id: Ulid,
        to: TransferState,
        now: Ms,
    ) -> Result<TransferRequest, AdmissionError>;

    /// The acceptance triple: cancel the initiator's occupant row, activate
    /// the target's, mark the transfer ACCEPTED. One atomic commit,
    /// linearizable per reservation — all three or none.
    async fn accept_transfer(
        &self,
        id: Ulid,
        now: Ms,
    ) -> Result<TransferRequest, AdmissionError>;

    /// Transfers still actionable for this target. Rows past their deadline
    /// are excluded but not rewritten.
    async fn pending_for_target(
        &self,
        user: Ulid,
        now: Ms,
    ) -> Result<Vec<TransferRequest>, AdmissionError>;

    /// Ids of stored-PENDING rows whose deadline has passed, for the sweeper.
    async fn collect_expired(&self, now: Ms) -> Result<Vec<Ulid>, AdmissionError>;
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Current window for the key, normalized for rollover: an expired
    /// window reads as fresh. Never mutates.
    async fn check_limit(
        &self,
        key: &str,
        now: Ms,
        window_ms: Ms,
    ) -> Result<RateLimitEntry, AdmissionError>;

    /// Record one consumption, creating or rolling the window as needed.
    async fn increment(&self, key: &str, now: Ms, window_ms: Ms) -> Result<(), AdmissionError>;

    async fn reset(&self, key: &str) -> Result<(), AdmissionError>;

    /// Drop windows that have expired. Returns the eviction count.
    async fn cleanup(&self, now: Ms, window_ms: Ms) -> Result<usize, AdmissionError>;
}

// ── In-memory provider ───────────────────────────────────────────

pub struct MemoryStore {
    reservations: DashMap<Ulid, SharedReservation>,
    /// user → reservations where the user holds (or recently held) an
    /// occupant row. A superset index: readers re-check row state.
    by_user: DashMap<Ulid, Vec<Ulid>>,
    capacities: DashMap<Day, Arc<RwLock<DateCapacity>>>,
    transfers: DashMap<Ulid, Arc<RwLock<TransferRequest>>>,
    /// (reservation, target) → (transfer id, expires_at) of the one PENDING
    /// transfer for the pair. Entries leave when the transfer is decided.
    pending_pairs: DashMap<(Ulid, Ulid), (Ulid, Ms)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            reservations: DashMap::new(),
            by_user: DashMap::new(),
            capacities: DashMap::new(),
            transfers: DashMap::new(),
            pending_pairs: DashMap::new(),
        }
    }

    fn index_user(&self, user: Ulid, reservation_id: Ulid) {
        let mut ids = self.by_user.entry(user).or_default();
        if !ids.contains(&reservation_id) {
            ids.push(reservation_id);
        }
    }

    fn unindex_user(&self, user: &Ulid, reservation_id: &Ulid) {
        if let Some(mut ids) = self.by_user.get_mut(user) {
            ids.retain(|r| r != reservation_id);
        }
    }

    fn release_pair_slot(&self, reservation_id: Ulid, target: Ulid, transfer_id: Ulid) {
        if let Entry::Occupied(e) = self.pending_pairs.entry((reservation_id, target))
            && e.get().0 == transfer_id
        {
            e.remove();
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn create_reservation(&self, state: ReservationState) -> Result<(), AdmissionError> {
        let id = state.reservation.id;
        let user = state.reservation.primary_user;
        if self.reservations.contains_key(&id) {
            return Err(AdmissionError::Conflict("reservation id already exists"));
        }
        self.reservations.insert(id, Arc::new(RwLock::new(state)));
        self.index_user(user, id);
        Ok(())
    }

    async fn get_reservation(
        &self,
        id: Ulid,
    ) -> Result<Option<ReservationState>, AdmissionError> {
        let Some(row) = self.reservations.get(&id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        Ok(Some(row.read().await.clone()))
    }

    async fn active_days_for(&self, user: Ulid) -> Result<Vec<Day>, AdmissionError> {
        let ids: Vec<Ulid> = self
            .by_user
            .get(&user)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut days = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(row) = self.reservations.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            let state = row.read().await;
            if state.reservation.status == ReservationStatus::Active
                && state.is_active_occupant(user)
            {
                days.push(state.reservation.day);
            }
        }
        Ok(days)
    }

    async fn is_active_occupant(
        &self,
        reservation_id: Ulid,
        user: Ulid,
    ) -> Result<bool, AdmissionError> {
        let Some(row) = self
            .reservations
            .get(&reservation_id)
            .map(|e| e.value().clone())
        else {
            return Ok(false);
        };
        Ok(row.read().await.is_active_occupant(user))
    }

    async fn add_occupant(
        &self,
        reservation_id: Ulid,
        user: Ulid,
        now: Ms,
    ) -> Result<(), AdmissionError> {
        let row = self
            .reservations
            .get(&reservation_id)
            .map(|e| e.value().clone())
            .ok_or(AdmissionError::Validation("unknown reservation"))?;
        let mut state = row.write().await;
        if state.reservation.status != ReservationStatus::Active {
            return Err(AdmissionError::Validation("reservation is not active"));
        }
        if state.is_active_occupant(user) {
            return Err(AdmissionError::Conflict(
                "user already occupies this reservation",
            ));
        }
        if state.occupants.len() >= MAX_OCCUPANTS_PER_RESERVATION
            && state.occupant_mut(user).is_none()
        {
            return Err(AdmissionError::Validation(
                "too many occupant rows on this reservation",
            ));
        }
        match state.occupant_mut(user) {
            Some(prior) => {
                prior.status = OccupantStatus::Active;
                prior.added_at = now;
                prior.cancelled_at = None;
            }
            None => state.occupants.push(Occupant {
                user,
                is_primary: false,
                status: OccupantStatus::Active,
                added_at: now,
                cancelled_at: None,
            }),
        }
        // index under the row lock so readers never miss the new day
        self.index_user(user, reservation_id);
        Ok(())
    }

    async fn cancel_reservation(&self, id: Ulid, now: Ms) -> Result<Day, AdmissionError> {
        let row = self
            .reservations
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(AdmissionError::Validation("unknown reservation"))?;
        let mut state = row.write().await;
        if state.reservation.status == ReservationStatus::Cancelled {
            return Err(AdmissionError::Conflict("reservation already cancelled"));
        }
        state.reservation.status = ReservationStatus::Cancelled;
        let mut affected = Vec::new();
        for occupant in &mut state.occupants {
            if occupant.status == OccupantStatus::Active {
                occupant.status = OccupantStatus::Cancelled;
                occupant.cancelled_at = Some(now);
                affected.push(occupant.user);
            }
        }
        let day = state.reservation.day;
        drop(state);
        for user in affected {
            self.unindex_user(&user, &id);
        }
        Ok(day)
    }
}

#[async_trait]
impl CapacityStore for MemoryStore {
    async fn try_admit(&self, day: Day, default_max: u32) -> Result<u32, AdmissionError> {
        let row = self
            .capacities
            .entry(day)
            .or_insert_with(|| {
                Arc::new(RwLock::new(DateCapacity {
                    day,
                    max_capacity: default_max,
                    total_bookings: 0,
                }))
            })
            .clone();
        let mut cap = row.write().await;
        if cap.total_bookings >= cap.max_capacity {
            return Err(AdmissionError::CapacityExceeded {
                day,
                max_capacity: cap.max_capacity,
            });
        }
        cap.total_bookings += 1;
        Ok(cap.remaining())
    }

    async fn release(&self, day: Day) -> Result<(), AdmissionError> {
        let Some(row) = self.capacities.get(&day).map(|e| e.value().clone()) else {
            return Ok(()); // nothing ever admitted for this day
        };
        let mut cap = row.write().await;
        cap.total_bookings = cap.total_bookings.saturating_sub(1);
        Ok(())
    }

    async fn get_capacity(&self, day: Day) -> Result<Option<DateCapacity>, AdmissionError> {
        let Some(row) = self.capacities.get(&day).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        Ok(Some(*row.read().await))
    }

    async fn set_max_capacity(&self, day: Day, max: u32) -> Result<(), AdmissionError> {
        let row = self
            .capacities
            .entry(day)
            .or_insert_with(|| {
                Arc::new(RwLock::new(DateCapacity {
                    day,
                    max_capacity: max,
                    total_bookings: 0,
                }))
            })
            .clone();
        let mut cap = row.write().await;
        if max < cap.total_bookings {
            return Err(AdmissionError::Validation(
                "maximum below existing bookings",
            ));
        }
        cap.max_capacity = max;
        Ok(())
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn insert_pending(&self, transfer: TransferRequest) -> Result<(), AdmissionError> {
        let now = transfer.created_at;
        let live_for_target = self
            .pending_pairs
            .iter()
            .filter(|e| e.key().1 == transfer.target && now < e.value().1)
            .count();
        if live_for_target >= MAX_PENDING_TRANSFERS_PER_TARGET {
            return Err(AdmissionError::Validation(
                "too many pending transfers for this user",
            ));
        }

        // The pair slot is claimed under the map shard lock, so two
        // concurrent creates for the same pair cannot both succeed.
        match self
            .pending_pairs
            .entry((transfer.reservation_id, transfer.target))
        {
            Entry::Occupied(mut e) => {
                let (_, expires_at) = *e.get();
                if now < expires_at {
                    return Err(AdmissionError::Conflict(
                        "a pending transfer already exists for this user",
                    ));
                }
                // The previous holder is past its deadline: effectively
                // expired, safe to displace. Its row is rewritten on touch.
                e.insert((transfer.id, transfer.expires_at));
            }
            Entry::Vacant(e) => {
                e.insert((transfer.id, transfer.expires_at));
            }
        }
        self.transfers
            .insert(transfer.id, Arc::new(RwLock::new(transfer)));
        Ok(())
    }

    async fn get_transfer(&self, id: Ulid) -> Result<Option<TransferRequest>, AdmissionError> {
        let Some(row) = self.transfers.get(&id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        Ok(Some(row.read().await.clone()))
    }

    async fn finish_transfer(
        &self,
        id: Ulid,
        to: TransferState,
        now: Ms,
    ) -> Result<TransferRequest, AdmissionError> {
        let row = self
            .transfers
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(AdmissionError::Validation("unknown transfer"))?;
        let mut transfer = row.write().await;
        if transfer.state != TransferState::Pending {
            return Err(AdmissionError::Conflict("transfer already decided"));
        }
        transfer.state = to;
        transfer.decided_at = Some(now);
        self.release_pair_slot(transfer.reservation_id, transfer.target, transfer.id);
        Ok(transfer.clone())
    }

    async fn accept_transfer(
        &self,
        id: Ulid,
        now: Ms,
    ) -> Result<TransferRequest, AdmissionError> {
        let t_row = self
            .transfers
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(AdmissionError::Validation("unknown transfer"))?;
        // reservation_id never changes after creation
        let reservation_id = t_row.read().await.reservation_id;
        let r_row = self
            .reservations
            .get(&reservation_id)
            .map(|e| e.value().clone())
            .ok_or(AdmissionError::Validation("unknown reservation"))?;

        // Reservation lock first, then transfer lock. This is the only path
        // taking both, so the order cannot deadlock; it also serializes
        // concurrent accepts touching the same reservation.
        let mut state = r_row.write().await;
        let mut transfer = t_row.write().await;

        if transfer.state != TransferState::Pending {
            return Err(AdmissionError::Conflict("transfer already decided"));
        }
        if now >= transfer.expires_at {
            // Re-judged inside the commit: the deadline may have passed
            // since the caller's check. Rewrite on touch.
            transfer.state = TransferState::Expired;
            transfer.decided_at = Some(now);
            self.release_pair_slot(reservation_id, transfer.target, transfer.id);
            return Err(AdmissionError::TransferExpired(id));
        }
        if state.reservation.status != ReservationStatus::Active {
            return Err(AdmissionError::Validation("reservation is not active"));
        }
        if state.is_active_occupant(transfer.target) {
            return Err(AdmissionError::Conflict(
                "target already occupies this reservation",
            ));
        }
        if state.occupants.len() >= MAX_OCCUPANTS_PER_RESERVATION
            && state.occupant_mut(transfer.target).is_none()
        {
            return Err(AdmissionError::Validation(
                "too many occupant rows on this reservation",
            ));
        }
        let initiator = transfer.initiator;
        let target = transfer.target;
        match state.active_occupant_mut(initiator) {
            Some(giver) => {
                giver.status = OccupantStatus::Cancelled;
                giver.cancelled_at = Some(now);
            }
            None => {
                return Err(AdmissionError::Conflict(
                    "initiator no longer holds an occupant slot",
                ));
            }
        }
        match state.occupant_mut(target) {
            Some(prior) => {
                prior.status = OccupantStatus::Active;
                prior.added_at = now;
                prior.cancelled_at = None;
            }
            None => state.occupants.push(Occupant {
                user: target,
                is_primary: false,
                status: OccupantStatus::Active,
                added_at: now,
                cancelled_at: None,
            }),
        }
        transfer.state = TransferState::Accepted;
        transfer.decided_at = Some(now);
        self.release_pair_slot(reservation_id, target, transfer.id);
        // Index while the row locks are still held so a reader never sees
        // the target's new day missing from the superset index.
        self.index_user(target, reservation_id);
        let done = transfer.clone();
        drop(transfer);
        drop(state);
        self.unindex_user(&initiator, &reservation_id);
        Ok(done)
    }

    async fn pending_for_target(
        &self,
        user: Ulid,
        now: Ms,
    ) -> Result<Vec<TransferRequest>, AdmissionError> {
        let mut out = Vec::new();
        for entry in self.transfers.iter() {
            let row = entry.value().clone();
            if let Ok(transfer) = row.try_read()
                && transfer.target == user
                && transfer.is_actionable(now)
            {
                out.push(transfer.clone());
            }
        }
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    async fn collect_expired(&self, now: Ms) -> Result<Vec<Ulid>, AdmissionError> {
        let mut expired = Vec::new();
        for entry in self.transfers.iter() {
            let row = entry.value().clone();
            if let Ok(transfer) = row.try_read()
                && transfer.state == TransferState::Pending
                && now >= transfer.expires_at
            {
                expired.push(transfer.id);
            }
        }
        Ok(expired)
    }
}

pub struct MemoryRateLimitStore {
    entries: DashMap<String, RateLimitEntry>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for MemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn check_limit(
        &self,
        key: &str,
        now: Ms,
        window_ms: Ms,
    ) -> Result<RateLimitEntry, AdmissionError> {
        let entry = self
            .entries
            .get(key)
            .map(|e| *e.value())
            .unwrap_or_else(|| RateLimitEntry::fresh(now));
        if entry.expired(now, window_ms) {
            Ok(RateLimitEntry::fresh(now))
        } else {
            Ok(entry)
        }
    }

    async fn increment(&self, key: &str, now: Ms, window_ms: Ms) -> Result<(), AdmissionError> {
        if self.entries.len() >= MAX_TRACKED_RATE_KEYS && !self.entries.contains_key(key) {
            // Shed dead windows inline rather than grow without bound.
            self.entries.retain(|_, e| !e.expired(now, window_ms));
        }
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry::fresh(now));
        if entry.expired(now, window_ms) {
            *entry = RateLimitEntry::fresh(now);
        }
        entry.count += 1;
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), AdmissionError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn cleanup(&self, now: Ms, window_ms: Ms) -> Result<usize, AdmissionError> {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.expired(now, window_ms));
        Ok(before - self.entries.len())
    }
}
