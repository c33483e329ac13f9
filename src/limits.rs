//! Hard limits and defaults. The `MAX_*` constants are guard rails against
//! unbounded growth or nonsense input; the `DEFAULT_*` constants are the
//! configuration fallbacks when nothing overrides them.

use crate::model::Ms;

/// Upper bound on tracked rate-limit windows before the store sheds
/// expired entries inline.
pub const MAX_TRACKED_RATE_KEYS: usize = 100_000;

/// Occupant rows (active or cancelled) a single reservation may carry.
pub const MAX_OCCUPANTS_PER_RESERVATION: usize = 16;

/// Pending transfers a single target user may accumulate.
pub const MAX_PENDING_TRANSFERS_PER_TARGET: usize = 32;

/// Bookable day range: the Unix epoch up to roughly year 2170.
pub const MIN_VALID_DAY: i64 = 0;
pub const MAX_VALID_DAY: i64 = 73_048;

/// Longest permitted run of back-to-back booked days.
pub const DEFAULT_MAX_CONSECUTIVE_DAYS: usize = 3;

/// Capacity assumed for a day whose row has not been configured yet.
pub const DEFAULT_DAY_CAPACITY: u32 = 10;

/// How long a transfer proposal stays open: 24 hours.
pub const DEFAULT_TRANSFER_TTL_MS: Ms = 24 * 60 * 60 * 1000;

pub const DEFAULT_CREATE_MAX_REQUESTS: u32 = 5;
pub const DEFAULT_CREATE_WINDOW_MS: Ms = 60_000;

pub const DEFAULT_TRANSFER_MAX_REQUESTS: u32 = 10;
pub const DEFAULT_TRANSFER_WINDOW_MS: Ms = 60_000;

/// Cadence of the background maintenance pass.
pub const DEFAULT_SWEEP_INTERVAL_MS: Ms = 5_000;
