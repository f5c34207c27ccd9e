//! Reservation sweeper
//!
//! Background task that reclaims reservations past their expiry, keeping
//! counters consistent when a worker dies between reserve and release.
//! Sweeping is idempotent; a second pass over the same state finds nothing.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audit::{AuditAction, AuditEvent, AuditLog};
use crate::ledger::CapacityLedger;
use crate::monitor::{LiveMonitor, MonitorEvent};

pub struct ReservationSweeper;

impl ReservationSweeper {
    /// Spawn the periodic sweep loop; cancel the token to stop it
    pub fn spawn(
        ledger: Arc<CapacityLedger>,
        audit: Arc<AuditLog>,
        monitor: Arc<LiveMonitor>,
        actor: String,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            // The immediate first tick is consumed so the first real sweep
            // happens one interval in
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let swept = ledger.sweep_expired().await;
                if swept.is_empty() {
                    continue;
                }

                info!(count = swept.len(), "expired reservations reclaimed");
                for reservation in swept {
                    monitor.emit(MonitorEvent::ReservationExpired {
                        tool_name: reservation.tool_name.clone(),
                    });
                    audit
                        .record(
                            AuditEvent::new(AuditAction::ReservationExpired, &actor)
                                .with_tool(&reservation.id.to_string(), &reservation.tool_name)
                                .with_details(serde_json::json!({
                                    "additional_requests": reservation.additional_requests,
                                    "additional_llm": reservation.additional_llm,
                                    "expires_at_ms": reservation.expires_at_ms,
                                })),
                        )
                        .await;
                }

                monitor.publish(ledger.snapshot().await);
            }
        })
    }
}
