//! Parallel-execution candidate resolution
//!
//! A batch of `t` teams with `m` members each needs `t` request slots and
//! `t·m` LLM slots. Candidates are tried widest first without waiting;
//! only when nothing fits does the caller wait on the most-reduced shape.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RuntimeError;
use crate::ledger::{AdmissionGate, CapacityLedger, CapacityReservation, ReserveOutcome, ReserveRequest, WaitOutcome};

/// The shape admission actually granted
#[derive(Debug)]
pub struct AppliedParallelism {
    pub teams: u32,
    pub members: u32,
    pub reservation: CapacityReservation,
}

/// All `(t, m)` with `t ∈ [1..=teams]`, `m ∈ [1..=members]`, widest
/// (largest `t·m`) first; ties prefer more teams
pub fn parallelism_candidates(teams: u32, members: u32) -> Vec<(u32, u32)> {
    let mut candidates = Vec::with_capacity((teams * members) as usize);
    for t in 1..=teams.max(1) {
        for m in 1..=members.max(1) {
            candidates.push((t, m));
        }
    }
    candidates.sort_by_key(|&(t, m)| (std::cmp::Reverse(t * m), std::cmp::Reverse(t)));
    candidates
}

/// Resolve the widest shape the ledger will admit
///
/// First pass tries every candidate without waiting; if none fits, waits
/// on the most-reduced candidate `(1, 1)` up to `max_wait`.
#[allow(clippy::too_many_arguments)]
pub async fn resolve_parallelism(
    ledger: &CapacityLedger,
    base: &ReserveRequest,
    teams: u32,
    members: u32,
    max_wait: Duration,
    poll: Duration,
    cancel: &CancellationToken,
    gate: Option<Arc<dyn AdmissionGate>>,
) -> Result<AppliedParallelism, RuntimeError> {
    let candidates = parallelism_candidates(teams, members);

    for &(t, m) in &candidates {
        let request = ReserveRequest {
            requests: t,
            llm: t * m,
            ..base.clone()
        };
        match ledger.try_reserve(&request, gate.clone()).await {
            ReserveOutcome::Granted(reservation) => {
                debug!(teams = t, members = m, "parallelism applied");
                return Ok(AppliedParallelism {
                    teams: t,
                    members: m,
                    reservation,
                });
            }
            ReserveOutcome::Denied { .. } => continue,
        }
    }

    let (t, m) = *candidates.last().expect("candidate set is never empty");
    let request = ReserveRequest {
        requests: t,
        llm: t * m,
        ..base.clone()
    };
    match ledger.reserve_or_wait(&request, max_wait, poll, cancel, gate).await {
        WaitOutcome::Granted(reservation) => Ok(AppliedParallelism {
            teams: t,
            members: m,
            reservation,
        }),
        WaitOutcome::TimedOut { waited, snapshot } => Err(RuntimeError::CapacityTimeout {
            waited_ms: waited.as_millis() as u64,
            snapshot,
        }),
        WaitOutcome::Evicted { snapshot } => Err(RuntimeError::CapacityEvicted { snapshot }),
        WaitOutcome::Cancelled => Err(RuntimeError::Cancelled),
    }
}
