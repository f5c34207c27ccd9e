//! Live monitor: push-based view model for observers
//!
//! Purely observational. Snapshots go out over a `watch` channel (readers
//! always see the latest), lifecycle events over a lossy `broadcast`
//! channel (slow readers miss events rather than slowing the runtime).

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::config::RuntimeLimits;
use crate::domain::TaskOutcome;
use crate::ledger::{ActiveCounts, RuntimeSnapshot};

/// Observable per-member state machine
///
/// `queued → admitted → running → (completed | failed | cancelled)`;
/// `admitted` may be skipped on the fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Queued,
    Admitted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Lifecycle events pushed to observers
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    ReservationGranted { tool_name: String },
    ReservationReleased { tool_name: String },
    ReservationExpired { tool_name: String },
    QueueEvicted { tool_name: String },
    MemberTransition {
        run_id: String,
        member_id: String,
        state: MemberState,
    },
    SubagentFinished {
        run_id: String,
        outcome: TaskOutcome,
    },
    TeamFinished {
        run_id: String,
        verdict: String,
    },
}

/// Handle observers subscribe through
pub struct LiveMonitor {
    snapshot_tx: watch::Sender<RuntimeSnapshot>,
    events_tx: broadcast::Sender<MonitorEvent>,
}

impl LiveMonitor {
    pub fn new(limits: RuntimeLimits) -> Self {
        let initial = RuntimeSnapshot {
            active_requests: 0,
            active_llm: 0,
            reserved_requests: 0,
            reserved_llm: 0,
            active: ActiveCounts::default(),
            reservations: Vec::new(),
            active_orchestrations: 0,
            queued: 0,
            queued_tools: Vec::new(),
            queue_evictions: 0,
            limits,
        };
        let (snapshot_tx, _) = watch::channel(initial);
        let (events_tx, _) = broadcast::channel(256);
        Self { snapshot_tx, events_tx }
    }

    /// Replace the published snapshot
    pub fn publish(&self, snapshot: RuntimeSnapshot) {
        let _ = self.snapshot_tx.send(snapshot);
    }

    /// Emit a lifecycle event; dropped when nobody listens
    pub fn emit(&self, event: MonitorEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<RuntimeSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events_tx.subscribe()
    }
}
