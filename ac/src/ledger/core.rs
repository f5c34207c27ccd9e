//! Ledger implementation
//!
//! One mutex guards counters, reservations, and the pending queue, so
//! every admission and release transition is linearized. Waiters are woken
//! through a `Notify` and also poll, which bounds staleness when capacity
//! is freed outside the ledger (a model-concurrency slot opening up).
//!
//! Promotion is ledger-driven: whenever capacity frees, the best-fitting
//! waiters are admitted in composite order and their reservations attached
//! to the queue entry for the waiter to collect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{QueueConfig, ReservationConfig, RuntimeLimits};
use crate::domain::{Priority, QueueClass};

use super::queue::{EntryState, PendingQueue, QueueEntry};
use super::reservation::{CapacityReservation, now_ms};
use super::snapshot::{ActiveCounts, DenyReason, ReservationView, RuntimeSnapshot};
use super::AdmissionGate;

/// What a caller wants admitted
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub tool_name: String,
    pub requests: u32,
    pub llm: u32,
    pub priority: Priority,
    pub queue_class: QueueClass,
    pub tenant_key: String,
}

impl ReserveRequest {
    pub fn new(tool_name: &str, requests: u32, llm: u32) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            requests,
            llm,
            priority: Priority::default(),
            queue_class: QueueClass::default(),
            tenant_key: tool_name.to_string(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_class(mut self, class: QueueClass) -> Self {
        self.queue_class = class;
        self
    }

    pub fn with_tenant(mut self, tenant_key: &str) -> Self {
        self.tenant_key = tenant_key.to_string();
        self
    }
}

/// Result of a single admission attempt
#[derive(Debug)]
pub enum ReserveOutcome {
    Granted(CapacityReservation),
    Denied {
        reasons: Vec<DenyReason>,
        snapshot: Box<RuntimeSnapshot>,
    },
}

/// Result of a bounded wait for admission
#[derive(Debug)]
pub enum WaitOutcome {
    Granted(CapacityReservation),
    TimedOut {
        waited: Duration,
        snapshot: Box<RuntimeSnapshot>,
    },
    Evicted {
        snapshot: Box<RuntimeSnapshot>,
    },
    Cancelled,
}

struct Inner {
    active_requests: u32,
    active_llm: u32,
    reserved_requests: u32,
    reserved_llm: u32,
    reservations: HashMap<Uuid, CapacityReservation>,
    queue: PendingQueue,
    active_orchestrations: u32,
}

/// Process-wide capacity counters and reservations
pub struct CapacityLedger {
    limits: RuntimeLimits,
    expiry: Duration,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl CapacityLedger {
    pub fn new(limits: RuntimeLimits, queue: &QueueConfig, reservation: &ReservationConfig) -> Self {
        Self {
            expiry: Duration::from_millis(reservation.expiry_ms),
            inner: Mutex::new(Inner {
                active_requests: 0,
                active_llm: 0,
                reserved_requests: 0,
                reserved_llm: 0,
                reservations: HashMap::new(),
                queue: PendingQueue::new(queue.max_length, Duration::from_millis(queue.skip_boost_ms)),
                active_orchestrations: 0,
            }),
            limits,
            notify: Notify::new(),
        }
    }

    pub fn limits(&self) -> &RuntimeLimits {
        &self.limits
    }

    /// Single admission attempt; grants a held reservation or explains why not
    pub async fn try_reserve(&self, request: &ReserveRequest, gate: Option<Arc<dyn AdmissionGate>>) -> ReserveOutcome {
        let mut inner = self.inner.lock().await;
        match self.try_reserve_locked(&mut inner, request, gate.as_deref()) {
            Ok(reservation) => ReserveOutcome::Granted(reservation),
            Err(reasons) => ReserveOutcome::Denied {
                reasons,
                snapshot: Box::new(self.snapshot_locked(&inner)),
            },
        }
    }

    fn try_reserve_locked(
        &self,
        inner: &mut Inner,
        request: &ReserveRequest,
        gate: Option<&dyn AdmissionGate>,
    ) -> Result<CapacityReservation, Vec<DenyReason>> {
        let mut reasons = Vec::new();

        let total_requests = inner.active_requests + inner.reserved_requests;
        if total_requests + request.requests > self.limits.max_total_active_requests {
            reasons.push(DenyReason::RequestsExhausted);
        }
        let total_llm = inner.active_llm + inner.reserved_llm;
        if total_llm + request.llm > self.limits.max_total_active_llm {
            reasons.push(DenyReason::LlmExhausted);
        }
        if !reasons.is_empty() {
            return Err(reasons);
        }

        if let Some(gate) = gate
            && !gate.try_acquire()
        {
            return Err(vec![DenyReason::ModelConcurrency]);
        }

        let reservation = CapacityReservation::new(
            &request.tool_name,
            request.requests,
            request.llm,
            self.expiry.as_millis() as u64,
        );
        inner.reserved_requests += request.requests;
        inner.reserved_llm += request.llm;
        inner.reservations.insert(reservation.id, reservation.clone());

        debug!(tool = %request.tool_name, id = %reservation.id, "reservation granted");
        Ok(reservation)
    }

    /// Wait up to `max_wait` for admission, polling at `poll` granularity.
    /// With `max_wait` of zero this is exactly one attempt.
    pub async fn reserve_or_wait(
        &self,
        request: &ReserveRequest,
        max_wait: Duration,
        poll: Duration,
        cancel: &CancellationToken,
        gate: Option<Arc<dyn AdmissionGate>>,
    ) -> WaitOutcome {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }

        let started = Instant::now();
        let deadline = started + max_wait;

        let entry_id = {
            let mut inner = self.inner.lock().await;
            match self.try_reserve_locked(&mut inner, request, gate.as_deref()) {
                Ok(reservation) => return WaitOutcome::Granted(reservation),
                Err(_) if max_wait.is_zero() => {
                    return WaitOutcome::TimedOut {
                        waited: started.elapsed(),
                        snapshot: Box::new(self.snapshot_locked(&inner)),
                    };
                }
                Err(_) => {
                    let entry = QueueEntry {
                        queue_class: request.queue_class,
                        tenant_key: request.tenant_key.clone(),
                        additional_requests: request.requests,
                        additional_llm: request.llm,
                        skip_count: 0,
                        priority: request.priority,
                        created_at: Instant::now(),
                        source: request.tool_name.clone(),
                        estimated_rounds: None,
                        estimated_duration_ms: None,
                    };
                    let id = inner.queue.insert(entry, gate.clone());
                    if let Some(outcome) = self.collect_locked(&mut inner, id, started, deadline) {
                        return outcome;
                    }
                    id
                }
            }
        };

        let poll = poll.max(Duration::from_millis(1));
        loop {
            let now = Instant::now();
            let window = poll.min(deadline.saturating_duration_since(now)).max(Duration::from_millis(1));

            tokio::select! {
                _ = cancel.cancelled() => {
                    let mut inner = self.inner.lock().await;
                    self.abandon_locked(&mut inner, entry_id);
                    drop(inner);
                    self.notify.notify_waiters();
                    return WaitOutcome::Cancelled;
                }
                _ = tokio::time::timeout(window, self.notify.notified()) => {}
            }

            let mut inner = self.inner.lock().await;
            // A gate slot may have opened without a ledger event
            self.promote_locked(&mut inner);
            if let Some(outcome) = self.collect_locked(&mut inner, entry_id, started, deadline) {
                return outcome;
            }
        }
    }

    /// Check a waiter's entry; `None` means keep waiting
    fn collect_locked(&self, inner: &mut Inner, entry_id: u64, started: Instant, deadline: Instant) -> Option<WaitOutcome> {
        let admitted = match &inner.queue.get(entry_id)?.state {
            EntryState::Admitted(_) => true,
            EntryState::Evicted => false,
            EntryState::Waiting => {
                if Instant::now() < deadline {
                    return None;
                }
                inner.queue.remove(entry_id);
                return Some(WaitOutcome::TimedOut {
                    waited: started.elapsed(),
                    snapshot: Box::new(self.snapshot_locked(inner)),
                });
            }
        };

        let entry = inner.queue.remove(entry_id)?;
        if admitted {
            match entry.state {
                EntryState::Admitted(reservation) => Some(WaitOutcome::Granted(reservation)),
                _ => None,
            }
        } else {
            Some(WaitOutcome::Evicted {
                snapshot: Box::new(self.snapshot_locked(inner)),
            })
        }
    }

    /// Remove a waiter that is giving up; rolls back an uncollected grant
    fn abandon_locked(&self, inner: &mut Inner, entry_id: u64) {
        let Some(entry) = inner.queue.remove(entry_id) else {
            return;
        };
        if let EntryState::Admitted(reservation) = entry.state {
            self.release_locked(inner, reservation.id);
            if let Some(gate) = entry.gate {
                gate.release();
            }
        }
    }

    /// Admit queued waiters while capacity fits, best first
    fn promote_locked(&self, inner: &mut Inner) {
        loop {
            let free_requests = self
                .limits
                .max_total_active_requests
                .saturating_sub(inner.active_requests + inner.reserved_requests);
            let free_llm = self
                .limits
                .max_total_active_llm
                .saturating_sub(inner.active_llm + inner.reserved_llm);

            let order = inner.queue.waiting_in_order(Instant::now());
            let mut skipped = Vec::new();
            let mut admitted = None;

            for id in order {
                let Some(pending) = inner.queue.get(id) else { continue };
                let fits = pending.entry.additional_requests <= free_requests
                    && pending.entry.additional_llm <= free_llm;
                if !fits {
                    skipped.push(id);
                    continue;
                }
                if let Some(gate) = &pending.gate
                    && !gate.try_acquire()
                {
                    skipped.push(id);
                    continue;
                }
                admitted = Some((
                    id,
                    pending.entry.source.clone(),
                    pending.entry.additional_requests,
                    pending.entry.additional_llm,
                ));
                break;
            }

            let Some((id, source, requests, llm)) = admitted else {
                break;
            };

            for skip in skipped {
                inner.queue.mark_skipped(skip);
            }

            let reservation = CapacityReservation::new(&source, requests, llm, self.expiry.as_millis() as u64);
            inner.reserved_requests += requests;
            inner.reserved_llm += llm;
            inner.reservations.insert(reservation.id, reservation.clone());
            inner.queue.admit(id, reservation);
            debug!(tool = %source, "queued entry promoted");
        }
    }

    /// The worker actually started: move the slots from reserved to active
    pub async fn consume(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(reservation) = inner.reservations.get_mut(&id) else {
            return false;
        };
        if reservation.is_consumed() {
            return false;
        }
        reservation.consumed_at_ms = Some(now_ms());
        let (requests, llm) = (reservation.additional_requests, reservation.additional_llm);

        sub_clamped(&mut inner.reserved_requests, requests, "reserved_requests");
        sub_clamped(&mut inner.reserved_llm, llm, "reserved_llm");
        inner.active_requests += requests;
        inner.active_llm += llm;
        true
    }

    /// Refresh a reservation's heartbeat, pushing its expiry forward
    pub async fn heartbeat(&self, id: Uuid) -> bool {
        let expiry_ms = self.expiry.as_millis() as u64;
        let mut inner = self.inner.lock().await;
        let Some(reservation) = inner.reservations.get_mut(&id) else {
            return false;
        };
        let now = now_ms();
        reservation.heartbeat_at_ms = now;
        reservation.expires_at_ms = now + expiry_ms;
        true
    }

    /// Release a reservation and decrement its counters. A second release
    /// of the same id (including after a sweep) is a no-op.
    pub async fn release(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        let released = self.release_locked(&mut inner, id);
        if released {
            self.promote_locked(&mut inner);
            drop(inner);
            self.notify.notify_waiters();
        }
        released
    }

    fn release_locked(&self, inner: &mut Inner, id: Uuid) -> bool {
        let Some(reservation) = inner.reservations.remove(&id) else {
            return false;
        };
        if reservation.is_consumed() {
            sub_clamped(&mut inner.active_requests, reservation.additional_requests, "active_requests");
            sub_clamped(&mut inner.active_llm, reservation.additional_llm, "active_llm");
        } else {
            sub_clamped(
                &mut inner.reserved_requests,
                reservation.additional_requests,
                "reserved_requests",
            );
            sub_clamped(&mut inner.reserved_llm, reservation.additional_llm, "reserved_llm");
        }
        debug!(id = %id, tool = %reservation.tool_name, "reservation released");
        true
    }

    /// Reclaim every reservation past its expiry; returns what was swept
    pub async fn sweep_expired(&self) -> Vec<CapacityReservation> {
        let now = now_ms();
        let mut inner = self.inner.lock().await;

        let expired: Vec<CapacityReservation> = inner
            .reservations
            .values()
            .filter(|r| r.is_expired(now))
            .cloned()
            .collect();

        for reservation in &expired {
            warn!(id = %reservation.id, tool = %reservation.tool_name, "expired reservation reclaimed");
            self.release_locked(&mut inner, reservation.id);
        }

        if !expired.is_empty() {
            self.promote_locked(&mut inner);
            drop(inner);
            self.notify.notify_waiters();
        }
        expired
    }

    /// Enter the independent orchestration cap
    pub async fn begin_orchestration(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.active_orchestrations >= self.limits.max_concurrent_orchestrations {
            return false;
        }
        inner.active_orchestrations += 1;
        true
    }

    pub async fn end_orchestration(&self) {
        let mut inner = self.inner.lock().await;
        sub_clamped(&mut inner.active_orchestrations, 1, "active_orchestrations");
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Point-in-time view of counters, reservations, and the queue
    pub async fn snapshot(&self) -> RuntimeSnapshot {
        let inner = self.inner.lock().await;
        self.snapshot_locked(&inner)
    }

    fn snapshot_locked(&self, inner: &Inner) -> RuntimeSnapshot {
        let mut active = ActiveCounts::default();
        let mut reservations: Vec<ReservationView> = inner
            .reservations
            .values()
            .map(|r| {
                if r.is_consumed() {
                    if r.tool_name.contains("team") {
                        active.team_runs += r.additional_requests;
                        active.team_members += r.additional_llm;
                    } else {
                        active.subagent_requests += r.additional_requests;
                        active.subagent_agents += r.additional_llm;
                    }
                }
                ReservationView {
                    id: r.id,
                    tool_name: r.tool_name.clone(),
                    additional_requests: r.additional_requests,
                    additional_llm: r.additional_llm,
                    created_at_ms: r.created_at_ms,
                    heartbeat_at_ms: r.heartbeat_at_ms,
                    expires_at_ms: r.expires_at_ms,
                    consumed: r.is_consumed(),
                }
            })
            .collect();
        reservations.sort_by_key(|r| r.created_at_ms);

        let stats = inner.queue.stats();
        RuntimeSnapshot {
            active_requests: inner.active_requests,
            active_llm: inner.active_llm,
            reserved_requests: inner.reserved_requests,
            reserved_llm: inner.reserved_llm,
            active,
            reservations,
            active_orchestrations: inner.active_orchestrations,
            queued: stats.waiting,
            queued_tools: inner.queue.waiting_sources(),
            queue_evictions: stats.evictions,
            limits: self.limits.clone(),
        }
    }
}

/// Decrement with under-zero detection: a drop below zero is a bug, logged
/// and clamped rather than crashing
fn sub_clamped(counter: &mut u32, amount: u32, name: &str) {
    if amount > *counter {
        warn!(counter = name, value = *counter, amount, "counter underflow clamped");
        *counter = 0;
    } else {
        *counter -= amount;
    }
}
