//! Workflow ownership
//!
//! At most one live instance owns a workflow at a time. Ownership records
//! are files in the shared directory; claims serialize through an advisory
//! lock so two instances racing on the same workflow cannot both win.
//!
//! Liveness: the owner's instance id against the coordinator's live set is
//! authoritative. The pid probe is a heuristic that only downgrades a
//! same-host owner whose registration is already gone or stale.

mod manager;
mod record;

pub use manager::{ClaimOutcome, OwnershipManager, OwnershipStatus};
pub use record::OwnershipRecord;
