//! Workstate - shared-directory state primitives for cooperating processes
//!
//! Multiple host processes share one workspace-relative state directory.
//! Workstate gives them the three primitives everything else is built on:
//!
//! - **Atomic replace**: write-to-temp + rename on the same filesystem,
//!   so a reader never observes a half-written record
//! - **Advisory locks**: `fs2` file locks for the few multi-writer files
//! - **Layout**: one type that owns every path, so callers never
//!   concatenate path segments themselves
//!
//! No true cross-host atomic primitives are assumed. Readers re-validate
//! after each peek; networked filesystems weaken these guarantees.

mod atomic;
mod error;
mod layout;
mod lock;

pub use atomic::{list_json_files, read_json, remove_file_if_exists, write_json_atomic};
pub use error::StateError;
pub use layout::StateLayout;
pub use lock::FileLock;
