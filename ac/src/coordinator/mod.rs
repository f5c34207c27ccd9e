//! Cross-instance coordination
//!
//! Cooperating host processes register themselves in a shared directory
//! and read each other's registrations on a low-frequency timer. The
//! in-memory view feeds admission: per-provider fair shares, and slot
//! stealing from under-utilizing peers. Admission itself never touches
//! the filesystem.
//!
//! Filesystem trouble degrades to single-instance mode (full limit, no
//! peers); it never blocks core progress.

mod core;
mod registry;

pub use core::{InstanceCoordinator, PeerView};
pub use registry::InstanceRegistration;
