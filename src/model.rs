use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const MS_PER_DAY: Ms = 86_400_000;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// A UTC calendar day, counted in whole days since the Unix epoch.
///
/// Construction strips the time-of-day component, so any two instants inside
/// the same UTC day map to the same `Day`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Day(pub i64);

impl Day {
    pub fn from_ms(ms: Ms) -> Self {
        Day(ms.div_euclid(MS_PER_DAY))
    }

    /// Midnight UTC at the start of this day.
    pub fn start_ms(&self) -> Ms {
        self.0 * MS_PER_DAY
    }

    pub fn next(&self) -> Day {
        Day(self.0 + 1)
    }

    /// Whole days between `prev` and `self` (positive when `self` is later).
    pub fn gap_from(&self, prev: Day) -> i64 {
        self.0 - prev.0
    }
}

impl std::fmt::Display for Day {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "day+{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Active,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OccupantStatus {
    Active,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Pending,
    Accepted,
    Declined,
    Expired,
}

/// One booking for one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub day: Day,
    pub primary_user: Ulid,
    pub status: ReservationStatus,
    /// Whether additional occupant slots may be offered to other users.
    pub transferable: bool,
    pub created_at: Ms,
}

/// One person attached to a reservation, primary or additional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupant {
    pub user: Ulid,
    pub is_primary: bool,
    pub status: OccupantStatus,
    pub added_at: Ms,
    pub cancelled_at: Option<Ms>,
}

/// Per-day booking counter against a fixed maximum.
/// Invariant: `0 <= total_bookings <= max_capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateCapacity {
    pub day: Day,
    pub max_capacity: u32,
    pub total_bookings: u32,
}

impl DateCapacity {
    pub fn remaining(&self) -> u32 {
        self.max_capacity.saturating_sub(self.total_bookings)
    }
}

/// A time-boxed proposal to move an occupant slot from `initiator` to
/// `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub initiator: Ulid,
    pub target: Ulid,
    pub state: TransferState,
    pub created_at: Ms,
    pub decided_at: Option<Ms>,
    pub expires_at: Ms,
}

impl TransferRequest {
    /// The state a reader must act on. A stored PENDING row past its
    /// deadline is already expired even though nothing has rewritten it yet,
    /// so the persisted field alone is never trusted.
    pub fn effective_state(&self, now: Ms) -> TransferState {
        if self.state == TransferState::Pending && now >= self.expires_at {
            TransferState::Expired
        } else {
            self.state
        }
    }

    pub fn is_actionable(&self, now: Ms) -> bool {
        self.effective_state(now) == TransferState::Pending
    }
}

/// Fixed-window request counter. Disposable: nothing beyond the current
/// window needs to survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_started_at: Ms,
}

impl RateLimitEntry {
    pub fn fresh(now: Ms) -> Self {
        Self {
            count: 0,
            window_started_at: now,
        }
    }

    pub fn expired(&self, now: Ms, window_ms: Ms) -> bool {
        now - self.window_started_at >= window_ms
    }
}

/// A reservation plus the occupant rows it owns. This is the unit of
/// locking: transfer acceptance rewrites occupant rows and must not
/// interleave with another writer on the same reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationState {
    pub reservation: Reservation,
    pub occupants: Vec<Occupant>,
}

impl ReservationState {
    /// A new reservation always starts with its primary occupant row.
    pub fn new(reservation: Reservation, now: Ms) -> Self {
        let primary = Occupant {
            user: reservation.primary_user,
            is_primary: true,
            status: OccupantStatus::Active,
            added_at: now,
            cancelled_at: None,
        };
        Self {
            reservation,
            occupants: vec![primary],
        }
    }

    pub fn active_occupant(&self, user: Ulid) -> Option<&Occupant> {
        self.occupants
            .iter()
            .find(|o| o.user == user && o.status == OccupantStatus::Active)
    }

    pub fn active_occupant_mut(&mut self, user: Ulid) -> Option<&mut Occupant> {
        self.occupants
            .iter_mut()
            .find(|o| o.user == user && o.status == OccupantStatus::Active)
    }

    /// Any row for this user, active or cancelled. Used to reactivate a
    /// previously cancelled slot instead of growing the row set.
    pub fn occupant_mut(&mut self, user: Ulid) -> Option<&mut Occupant> {
        self.occupants.iter_mut().find(|o| o.user == user)
    }

    pub fn is_active_occupant(&self, user: Ulid) -> bool {
        self.active_occupant(user).is_some()
    }

    pub fn active_occupant_count(&self) -> usize {
        self.occupants
            .iter()
            .filter(|o| o.status == OccupantStatus::Active)
            .count()
    }
}

/// Structured records handed to the external notification collaborator.
/// This system never formats or delivers user-facing messages itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    TransferCreated {
        transfer_id: Ulid,
        reservation_id: Ulid,
        initiator_id: Ulid,
        target_user_id: Ulid,
    },
    #[serde(rename_all = "camelCase")]
    TransferAccepted {
        transfer_id: Ulid,
        reservation_id: Ulid,
        initiator_id: Ulid,
        target_user_id: Ulid,
    },
    #[serde(rename_all = "camelCase")]
    TransferDeclined {
        transfer_id: Ulid,
        reservation_id: Ulid,
        initiator_id: Ulid,
        target_user_id: Ulid,
    },
    #[serde(rename_all = "camelCase")]
    TransferExpired {
        transfer_id: Ulid,
        reservation_id: Ulid,
        initiator_id: Ulid,
        target_user_id: Ulid,
    },
    #[serde(rename_all = "camelCase")]
    ReservationAdmitted {
        reservation_id: Ulid,
        user_id: Ulid,
        day: Day,
        remaining_spots: u32,
    },
    #[serde(rename_all = "camelCase")]
    ReservationCancelled {
        reservation_id: Ulid,
        user_id: Ulid,
        day: Day,
    },
    #[serde(rename_all = "camelCase")]
    OccupantAdded {
        reservation_id: Ulid,
        user_id: Ulid,
        day: Day,
    },
}

impl Event {
    /// JSON rendering for collaborators that consume text payloads.
    pub fn payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
