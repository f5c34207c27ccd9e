//! Append-only audit log
//!
//! JSON-lines file, one self-contained record per line. Appends buffer a
//! complete newline-terminated record and write it under a coarse lock, so
//! concurrent writers never interleave partial lines. Reads tolerate a
//! torn final line after a crash by skipping unparseable lines.

mod event;
mod log;

pub use event::{AuditAction, AuditEvent};
pub use log::{AuditFilter, AuditLog};
