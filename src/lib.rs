//! Reservation admission and transfer control.
//!
//! Decides, for every attempted booking or transfer, whether it is legal
//! right now: per-day capacity counters, per-user consecutive-day limits,
//! time-boxed occupant transfers, and per-client request budgets. The
//! surrounding web application — authentication, page rendering, the
//! persistence engine, email delivery — stays outside this crate: it
//! supplies an authenticated user id plus a client address, and consumes
//! admission decisions and notification events.
//!
//! Entry point is [`AdmissionCoordinator`]; storage is injected through the
//! capability traits in [`store`], with in-process providers included.

pub mod admission;
pub mod capacity;
pub mod config;
pub mod consecutive;
pub mod error;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod rate_limit;
pub mod store;
pub mod sweeper;
pub mod transfer;

pub use admission::{AdmissionCoordinator, AdmissionReceipt, PURPOSE_CREATE, PURPOSE_TRANSFER};
pub use capacity::CapacityLedger;
pub use config::{Config, RateLimitConfig};
pub use error::AdmissionError;
pub use model::{Day, Event, Ms, TransferState};
pub use notify::NotifyHub;
pub use rate_limit::RateLimiter;
pub use transfer::{TransferAction, TransferWorkflow};
