//! Coordinator implementation

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use workstate::{StateLayout, list_json_files, read_json, remove_file_if_exists, write_json_atomic};

use crate::config::CoordinatorConfig;
use crate::domain::InstanceId;
use crate::ledger::now_ms;

use super::registry::InstanceRegistration;

/// Peer summary for introspection
#[derive(Debug, Clone, Serialize)]
pub struct PeerView {
    pub instance_id: String,
    pub heartbeat_age_ms: u64,
    pub live: bool,
    pub active_models: HashMap<String, u32>,
}

struct CoordState {
    /// This instance's in-flight calls per provider
    local_active: HashMap<String, u32>,
    /// Slots stolen per provider, with the peer they were taken from
    stolen: HashMap<String, Vec<String>>,
    /// Last successfully read peer registrations, excluding self
    peers: HashMap<String, InstanceRegistration>,
    /// True after a filesystem failure: act as the only instance
    degraded: bool,
}

/// Shared-directory peer registry with fair-share accounting
///
/// All public methods are synchronous and cheap; the filesystem is only
/// touched by `register`/`unregister` and the background refresh.
pub struct InstanceCoordinator {
    layout: StateLayout,
    me: InstanceId,
    dead_after_ms: u64,
    provider_limits: HashMap<String, u32>,
    inner: Mutex<CoordState>,
}

impl InstanceCoordinator {
    pub fn new(layout: StateLayout, me: InstanceId, config: &CoordinatorConfig) -> Self {
        Self {
            layout,
            me,
            dead_after_ms: config.dead_after_ms,
            provider_limits: config.provider_limits.clone(),
            inner: Mutex::new(CoordState {
                local_active: HashMap::new(),
                stolen: HashMap::new(),
                peers: HashMap::new(),
                degraded: false,
            }),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.me
    }

    /// Write this instance's registration record
    pub fn register_instance(&self) {
        let registration = self.own_registration();
        let path = self.layout.instance_file(&registration.instance_id);
        if let Err(e) = write_json_atomic(&path, &registration) {
            warn!(error = %e, "instance registration failed, degrading to single-instance");
            self.inner.lock().expect("coordinator lock poisoned").degraded = true;
        } else {
            info!(instance = %registration.instance_id, "instance registered");
        }
    }

    /// Refresh this instance's heartbeat and current load
    pub fn update_heartbeat(&self) {
        let registration = self.own_registration();
        let path = self.layout.instance_file(&registration.instance_id);
        if let Err(e) = write_json_atomic(&path, &registration) {
            debug!(error = %e, "heartbeat write failed");
            self.inner.lock().expect("coordinator lock poisoned").degraded = true;
        }
    }

    /// Remove this instance's registration record
    pub fn unregister(&self) {
        let path = self.layout.instance_file(&self.me.to_string());
        if let Err(e) = remove_file_if_exists(&path) {
            debug!(error = %e, "unregister failed");
        }
    }

    fn own_registration(&self) -> InstanceRegistration {
        let inner = self.inner.lock().expect("coordinator lock poisoned");
        let mut registration = InstanceRegistration::new(&self.me);
        registration.active_models = inner.local_active.clone();
        registration.stolen_slots = inner
            .stolen
            .iter()
            .map(|(provider, peers)| (provider.clone(), peers.len() as u32))
            .collect();
        registration
    }

    /// Re-read peer registrations from the shared directory
    ///
    /// Also undoes recorded steals whose victim has re-activated.
    pub fn refresh_peers(&self) {
        let me = self.me.to_string();
        let files = match list_json_files(&self.layout.instances_dir()) {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "peer refresh failed, degrading to single-instance");
                self.inner.lock().expect("coordinator lock poisoned").degraded = true;
                return;
            }
        };

        let mut peers = HashMap::new();
        for file in files {
            match read_json::<InstanceRegistration>(&file) {
                Ok(Some(registration)) if registration.instance_id != me => {
                    peers.insert(registration.instance_id.clone(), registration);
                }
                Ok(_) => {}
                Err(e) => debug!(path = %file.display(), error = %e, "unreadable registration skipped"),
            }
        }

        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        inner.peers = peers;
        inner.degraded = false;
        self.undo_stale_steals(&mut inner);
    }

    /// Return stolen slots whose victim is using at least half its share again
    fn undo_stale_steals(&self, inner: &mut CoordState) {
        let now = now_ms();
        let live = self.live_count_locked(inner, now);

        for (provider, victims) in inner.stolen.clone() {
            let Some(share) = self.share_for_locked(&provider, live) else {
                continue;
            };
            let threshold = share / 2;
            let mut kept = Vec::new();
            for victim in victims {
                let reactivated = inner
                    .peers
                    .get(&victim)
                    .is_some_and(|p| p.is_live(now, self.dead_after_ms) && p.active_for(&provider) >= threshold);
                if reactivated {
                    debug!(%provider, %victim, "stolen slot returned");
                } else {
                    kept.push(victim);
                }
            }
            if kept.is_empty() {
                inner.stolen.remove(&provider);
            } else {
                inner.stolen.insert(provider, kept);
            }
        }
    }

    fn live_count_locked(&self, inner: &CoordState, now: u64) -> u32 {
        if inner.degraded {
            return 1;
        }
        let live_peers = inner
            .peers
            .values()
            .filter(|p| p.is_live(now, self.dead_after_ms))
            .count() as u32;
        live_peers + 1
    }

    fn share_for_locked(&self, provider: &str, live_instances: u32) -> Option<u32> {
        let limit = self.provider_limits.get(provider)?;
        let n = live_instances.max(1);
        Some(limit.div_ceil(n))
    }

    /// Instance ids currently considered live (self included)
    pub fn live_instances(&self) -> Vec<String> {
        let now = now_ms();
        let inner = self.inner.lock().expect("coordinator lock poisoned");
        let mut ids = vec![self.me.to_string()];
        if !inner.degraded {
            ids.extend(
                inner
                    .peers
                    .values()
                    .filter(|p| p.is_live(now, self.dead_after_ms))
                    .map(|p| p.instance_id.clone()),
            );
        }
        ids.sort();
        ids
    }

    /// Whether the given instance is in the live set
    pub fn is_instance_live(&self, instance_id: &str) -> bool {
        self.live_instances().iter().any(|id| id == instance_id)
    }

    /// This instance's fair share for a provider; `None` means no declared
    /// limit (unbounded)
    pub fn fair_share_for(&self, provider: &str) -> Option<u32> {
        let now = now_ms();
        let inner = self.inner.lock().expect("coordinator lock poisoned");
        let live = self.live_count_locked(&inner, now);
        self.share_for_locked(provider, live)
    }

    /// May this instance start another call against the provider?
    ///
    /// Within entitlement (share plus stolen slots) the answer is yes;
    /// at entitlement a steal from an under-utilizing peer is attempted.
    pub fn can_start_model(&self, provider: &str, model: &str) -> bool {
        let _ = model;
        let now = now_ms();
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        let live = self.live_count_locked(&inner, now);
        let Some(share) = self.share_for_locked(provider, live) else {
            return true;
        };

        let mine = inner.local_active.get(provider).copied().unwrap_or(0);
        let stolen = inner.stolen.get(provider).map(|v| v.len() as u32).unwrap_or(0);
        if mine < share + stolen {
            return true;
        }
        self.try_steal_locked(&mut inner, provider, share, now)
    }

    /// Try to steal one slot from a peer below half its entitlement
    pub fn try_steal_slot(&self, provider: &str) -> bool {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        let live = self.live_count_locked(&inner, now);
        let Some(share) = self.share_for_locked(provider, live) else {
            return false;
        };
        self.try_steal_locked(&mut inner, provider, share, now)
    }

    fn try_steal_locked(&self, inner: &mut CoordState, provider: &str, share: u32, now: u64) -> bool {
        let threshold = share / 2;
        let victim = inner
            .peers
            .values()
            .filter(|p| p.is_live(now, self.dead_after_ms))
            .find(|p| p.active_for(provider) < threshold)
            .map(|p| p.instance_id.clone());

        match victim {
            Some(victim) => {
                debug!(provider, victim = %victim, "slot stolen from under-utilizing peer");
                inner.stolen.entry(provider.to_string()).or_default().push(victim);
                true
            }
            None => false,
        }
    }

    /// A call against the provider started
    pub fn model_started(&self, provider: &str) {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        *inner.local_active.entry(provider.to_string()).or_insert(0) += 1;
    }

    /// A call against the provider finished (any outcome)
    pub fn model_finished(&self, provider: &str) {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        if let Some(count) = inner.local_active.get_mut(provider) {
            *count = count.saturating_sub(1);
        }
    }

    /// Drop all local per-provider counts
    pub fn clear_all_active_models(&self) {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        inner.local_active.clear();
    }

    /// Peer summaries for introspection, self included
    pub fn peer_views(&self) -> Vec<PeerView> {
        let now = now_ms();
        let inner = self.inner.lock().expect("coordinator lock poisoned");

        let mut views = vec![PeerView {
            instance_id: self.me.to_string(),
            heartbeat_age_ms: 0,
            live: true,
            active_models: inner.local_active.clone(),
        }];
        for peer in inner.peers.values() {
            views.push(PeerView {
                instance_id: peer.instance_id.clone(),
                heartbeat_age_ms: now.saturating_sub(peer.heartbeat_ms),
                live: peer.is_live(now, self.dead_after_ms),
                active_models: peer.active_models.clone(),
            });
        }
        views.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        views
    }

    /// Spawn the background refresh loop: read peers, write heartbeat
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                coordinator.refresh_peers();
                coordinator.update_heartbeat();
            }
        })
    }
}
