//! Capacity ledger and pending queue
//!
//! The ledger is the single source of truth for "may I start?". It owns
//! every reservation and the queue of waiters; both live under one lock so
//! all admission and release transitions are linearized.

mod core;
mod queue;
mod reservation;
mod snapshot;

pub use core::{CapacityLedger, ReserveOutcome, ReserveRequest, WaitOutcome};
pub use queue::{QueueEntry, QueueStats};
pub use reservation::{CapacityReservation, now_ms};
pub use snapshot::{ActiveCounts, DenyReason, ReservationView, RuntimeSnapshot};

/// Extra admission check consulted before an LLM slot is reserved
///
/// The adaptive rate controller implements this: `try_acquire` claims a
/// model-concurrency slot, `release` returns one. The ledger releases a
/// slot itself only when it abandons a granted-but-unclaimed reservation;
/// otherwise the caller pairs the acquire with its own completion path.
pub trait AdmissionGate: Send + Sync {
    fn try_acquire(&self) -> bool;
    fn release(&self);
}
