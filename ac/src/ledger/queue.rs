//! Pending queue: ordered waiters for capacity
//!
//! Pop order is a composite key, lower first:
//! 1. priority rank, 2. queue-class rank, 3. effective age (older first,
//! where each skip adds a configured boost), 4. tenant round-robin
//! (least recently served first), 5. insertion sequence.
//!
//! Entries stay in the queue after admission or eviction until their
//! waiter collects the result; only `Waiting` entries count toward the
//! length cap and pop order.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::domain::{Priority, QueueClass};

use super::AdmissionGate;
use super::reservation::CapacityReservation;

/// A waiter for capacity
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub queue_class: QueueClass,
    pub tenant_key: String,
    pub additional_requests: u32,
    pub additional_llm: u32,
    pub skip_count: u32,
    pub priority: Priority,
    pub created_at: Instant,
    pub source: String,
    pub estimated_rounds: Option<u32>,
    pub estimated_duration_ms: Option<u64>,
}

impl QueueEntry {
    pub fn new(source: &str, tenant_key: &str, additional_requests: u32, additional_llm: u32) -> Self {
        Self {
            queue_class: QueueClass::default(),
            tenant_key: tenant_key.to_string(),
            additional_requests,
            additional_llm,
            skip_count: 0,
            priority: Priority::default(),
            created_at: Instant::now(),
            source: source.to_string(),
            estimated_rounds: None,
            estimated_duration_ms: None,
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
}

/// What happened to a queued entry
#[derive(Debug)]
pub(crate) enum EntryState {
    Waiting,
    Admitted(CapacityReservation),
    Evicted,
}

pub(crate) struct PendingEntry {
    pub id: u64,
    pub entry: QueueEntry,
    pub insert_seq: u64,
    pub state: EntryState,
    pub gate: Option<Arc<dyn AdmissionGate>>,
}

/// Counters exposed on the snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub waiting: usize,
    pub evictions: u64,
}

pub(crate) struct PendingQueue {
    entries: Vec<PendingEntry>,
    next_id: u64,
    next_seq: u64,
    skip_boost: Duration,
    max_length: usize,
    evictions: u64,
    tenant_last_served: HashMap<String, u64>,
    serve_seq: u64,
}

impl PendingQueue {
    pub fn new(max_length: usize, skip_boost: Duration) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            next_seq: 0,
            skip_boost,
            max_length,
            evictions: 0,
            tenant_last_served: HashMap::new(),
            serve_seq: 0,
        }
    }

    /// Insert a waiter; evicts worst entries while over the cap.
    /// Returns the new entry's id (which may itself be evicted).
    pub fn insert(&mut self, entry: QueueEntry, gate: Option<Arc<dyn AdmissionGate>>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let insert_seq = self.next_seq;
        self.next_seq += 1;

        self.entries.push(PendingEntry {
            id,
            entry,
            insert_seq,
            state: EntryState::Waiting,
            gate,
        });

        while self.waiting_count() > self.max_length {
            let now = Instant::now();
            let Some(&worst) = self.waiting_in_order(now).last() else {
                break;
            };
            if let Some(e) = self.entries.iter_mut().find(|e| e.id == worst) {
                e.state = EntryState::Evicted;
                self.evictions += 1;
                tracing::warn!(source = %e.entry.source, "queue over cap, entry evicted");
            }
        }

        id
    }

    fn effective_age(&self, entry: &QueueEntry, now: Instant) -> Duration {
        now.saturating_duration_since(entry.created_at) + self.skip_boost * entry.skip_count
    }

    /// Ids of `Waiting` entries, best first
    pub fn waiting_in_order(&self, now: Instant) -> Vec<u64> {
        let mut waiting: Vec<&PendingEntry> = self
            .entries
            .iter()
            .filter(|e| matches!(e.state, EntryState::Waiting))
            .collect();

        waiting.sort_by_key(|e| {
            (
                e.entry.priority.rank(),
                e.entry.queue_class.rank(),
                Reverse(self.effective_age(&e.entry, now)),
                self.tenant_last_served.get(&e.entry.tenant_key).copied().unwrap_or(0),
                e.insert_seq,
            )
        });

        waiting.into_iter().map(|e| e.id).collect()
    }

    pub fn get(&self, id: u64) -> Option<&PendingEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Passed over during a scan: bump skip count so age compensation
    /// prevents starvation
    pub fn mark_skipped(&mut self, id: u64) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.id == id) {
            e.entry.skip_count += 1;
        }
    }

    /// Attach a granted reservation and record the tenant as served
    pub fn admit(&mut self, id: u64, reservation: CapacityReservation) {
        self.serve_seq += 1;
        let seq = self.serve_seq;
        if let Some(e) = self.entries.iter_mut().find(|e| e.id == id) {
            self.tenant_last_served.insert(e.entry.tenant_key.clone(), seq);
            e.state = EntryState::Admitted(reservation);
        }
    }

    /// Remove an entry entirely, returning it to the caller
    pub fn remove(&mut self, id: u64) -> Option<PendingEntry> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(idx))
    }

    pub fn waiting_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.state, EntryState::Waiting))
            .count()
    }

    /// Tool names of current waiters, in pop order
    pub fn waiting_sources(&self) -> Vec<String> {
        self.waiting_in_order(Instant::now())
            .into_iter()
            .filter_map(|id| self.get(id).map(|e| e.entry.source.clone()))
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            waiting: self.waiting_count(),
            evictions: self.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> PendingQueue {
        PendingQueue::new(16, Duration::from_millis(2_000))
    }

    #[test]
    fn test_priority_precedes_class_and_age() {
        let mut q = queue();
        let bg = q.insert(
            QueueEntry::new("bg", "t1", 1, 1)
                .with_priority(Priority::Background)
                .with_class(QueueClass::Interactive),
            None,
        );
        let crit = q.insert(
            QueueEntry::new("crit", "t2", 1, 1)
                .with_priority(Priority::Critical)
                .with_class(QueueClass::Batch),
            None,
        );

        let order = q.waiting_in_order(Instant::now());
        assert_eq!(order, vec![crit, bg]);
    }

    #[test]
    fn test_class_breaks_priority_tie() {
        let mut q = queue();
        let batch = q.insert(QueueEntry::new("batch", "t1", 1, 1).with_class(QueueClass::Batch), None);
        let interactive = q.insert(
            QueueEntry::new("interactive", "t2", 1, 1).with_class(QueueClass::Interactive),
            None,
        );

        let order = q.waiting_in_order(Instant::now());
        assert_eq!(order, vec![interactive, batch]);
    }

    #[test]
    fn test_older_entry_first_within_tie() {
        let mut q = queue();
        let now = Instant::now();

        let mut younger = QueueEntry::new("younger", "t1", 1, 1);
        younger.created_at = now - Duration::from_secs(1);
        let mut older = QueueEntry::new("older", "t2", 1, 1);
        older.created_at = now - Duration::from_secs(10);

        let younger_id = q.insert(younger, None);
        let older_id = q.insert(older, None);

        assert_eq!(q.waiting_in_order(now), vec![older_id, younger_id]);
    }

    #[test]
    fn test_skip_boost_raises_effective_age() {
        let mut q = queue();
        let now = Instant::now();

        let mut old = QueueEntry::new("old", "t1", 1, 1);
        old.created_at = now - Duration::from_secs(3);
        let old_id = q.insert(old, None);

        let mut skipped = QueueEntry::new("skipped", "t2", 1, 1);
        skipped.created_at = now - Duration::from_secs(1);
        let skipped_id = q.insert(skipped, None);

        assert_eq!(q.waiting_in_order(now), vec![old_id, skipped_id]);

        // Two skips at 2 s boost put the younger entry ahead
        q.mark_skipped(skipped_id);
        q.mark_skipped(skipped_id);
        assert_eq!(q.waiting_in_order(now), vec![skipped_id, old_id]);
    }

    #[test]
    fn test_tenant_rotation_on_full_tie() {
        let mut q = queue();
        let now = Instant::now();

        // Identical key material apart from the tenant
        let mut a = QueueEntry::new("a", "tenant-a", 1, 1);
        a.created_at = now;
        let mut b = QueueEntry::new("b", "tenant-b", 1, 1);
        b.created_at = now;

        let a_id = q.insert(a.clone(), None);
        let b_id = q.insert(b.clone(), None);

        // tenant-a was just served, so tenant-b goes first at the tie
        q.admit(a_id, CapacityReservation::new("a", 1, 1, 1_000));
        q.remove(a_id);

        let a2_id = q.insert(a, None);
        let order = q.waiting_in_order(now);
        assert_eq!(order[0], b_id);
        assert_eq!(order[1], a2_id);
    }

    #[test]
    fn test_eviction_over_cap() {
        let mut q = PendingQueue::new(2, Duration::ZERO);

        q.insert(QueueEntry::new("a", "t", 1, 1), None);
        q.insert(QueueEntry::new("b", "t", 1, 1), None);
        assert_eq!(q.stats().evictions, 0);

        // One more insert triggers exactly one eviction
        q.insert(QueueEntry::new("c", "t", 1, 1).with_priority(Priority::Background), None);
        let stats = q.stats();
        assert_eq!(stats.waiting, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_eviction_removes_worst() {
        let mut q = PendingQueue::new(1, Duration::ZERO);

        let critical = q.insert(QueueEntry::new("crit", "t", 1, 1).with_priority(Priority::Critical), None);
        let background = q.insert(QueueEntry::new("bg", "t", 1, 1).with_priority(Priority::Background), None);

        assert!(matches!(q.get(critical).unwrap().state, EntryState::Waiting));
        assert!(matches!(q.get(background).unwrap().state, EntryState::Evicted));
    }

    #[test]
    fn test_admitted_entries_leave_pop_order() {
        let mut q = queue();
        let a = q.insert(QueueEntry::new("a", "t1", 1, 1), None);
        let b = q.insert(QueueEntry::new("b", "t2", 1, 1), None);

        q.admit(a, CapacityReservation::new("a", 1, 1, 1_000));
        assert_eq!(q.waiting_in_order(Instant::now()), vec![b]);
        assert_eq!(q.waiting_count(), 1);
    }

    #[test]
    fn test_waiting_sources() {
        let mut q = queue();
        q.insert(QueueEntry::new("subagent_run", "t1", 1, 1), None);
        q.insert(
            QueueEntry::new("agent_team_run", "t2", 1, 1).with_priority(Priority::High),
            None,
        );

        assert_eq!(q.waiting_sources(), vec!["agent_team_run", "subagent_run"]);
    }

    #[test]
    fn test_remove_returns_entry() {
        let mut q = queue();
        let id = q.insert(QueueEntry::new("a", "t", 2, 3), None);

        let removed = q.remove(id).unwrap();
        assert_eq!(removed.entry.additional_requests, 2);
        assert_eq!(removed.entry.additional_llm, 3);
        assert!(q.remove(id).is_none());
    }
}
