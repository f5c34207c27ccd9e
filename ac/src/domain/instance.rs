//! Host process identity

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of one host process in the shared workspace
///
/// Rendered as `hostname:pid:start_ms`. The start timestamp disambiguates
/// pid reuse after a crash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    pub hostname: String,
    pub pid: u32,
    pub start_ms: u64,
}

impl InstanceId {
    /// Identity of the current process
    pub fn local() -> Self {
        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());

        Self {
            hostname,
            pid: std::process::id(),
            start_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Host-scoped identity used by operator tooling
    ///
    /// Pid and start time are zero: the claim belongs to the host, not to
    /// any process, so successive CLI invocations on the same host agree
    /// on who "this" is. A zero pid never probes as alive, so a real
    /// runtime process can always take such a claim over.
    pub fn host_scoped() -> Self {
        let mut id = Self::local();
        id.pid = 0;
        id.start_ms = 0;
        id
    }

    /// Parse from the `hostname:pid:start_ms` form
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.rsplitn(3, ':');
        let start_ms = parts.next()?.parse().ok()?;
        let pid = parts.next()?.parse().ok()?;
        let hostname = parts.next()?.to_string();
        if hostname.is_empty() {
            return None;
        }
        Some(Self {
            hostname,
            pid,
            start_ms,
        })
    }

    /// Whether this id refers to a process on the local host
    pub fn is_local_host(&self) -> bool {
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .is_some_and(|h| h == self.hostname)
    }

    /// Probe whether the pid is alive (signal 0); only meaningful on the
    /// same host, and only a heuristic even there
    pub fn pid_alive(&self) -> bool {
        // Pid 0 is the host-scoped marker, never a live process
        if self.pid == 0 || !self.is_local_host() {
            return false;
        }
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(self.pid as i32), None).is_ok()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.hostname, self.pid, self.start_ms)
    }
}
