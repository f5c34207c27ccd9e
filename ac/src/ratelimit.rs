//! Adaptive rate controller
//!
//! Learns a safe concurrency cap per (provider, model) from observed 429s:
//! multiplicative decrease on every 429 (floor 1), additive increase after
//! a run of clean successes (ceiling = provider-declared limit).
//! Observations age out of the window, so a quiet period lets the cap
//! recover.
//!
//! The controller also tracks in-flight calls per key; dispatch admission
//! asks it before the ledger reserves an LLM slot.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::AdaptiveConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ModelKey {
    provider: String,
    model: String,
}

#[derive(Debug)]
struct ModelState {
    current_max: u32,
    ceiling: u32,
    in_flight: u32,
    consecutive_successes: u32,
    recent_429s: VecDeque<Instant>,
}

impl ModelState {
    fn new(ceiling: u32) -> Self {
        Self {
            current_max: ceiling,
            ceiling,
            in_flight: 0,
            consecutive_successes: 0,
            recent_429s: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant, decay: Duration) {
        while let Some(&t) = self.recent_429s.front() {
            if now.duration_since(t) > decay {
                self.recent_429s.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Current learned limit for one (provider, model), for introspection
#[derive(Debug, Clone, Serialize)]
pub struct ModelLimitView {
    pub provider: String,
    pub model: String,
    pub current_max: u32,
    pub ceiling: u32,
    pub in_flight: u32,
    pub recent_429s: usize,
}

/// Learned per-model concurrency caps
pub struct AdaptiveRateController {
    config: AdaptiveConfig,
    provider_ceilings: HashMap<String, u32>,
    inner: Mutex<HashMap<ModelKey, ModelState>>,
}

impl AdaptiveRateController {
    pub fn new(config: AdaptiveConfig, provider_ceilings: HashMap<String, u32>) -> Self {
        Self {
            config,
            provider_ceilings,
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn ceiling_for(&self, provider: &str) -> u32 {
        self.provider_ceilings
            .get(provider)
            .copied()
            .unwrap_or(self.config.default_ceiling)
            .max(1)
    }

    fn with_state<R>(&self, provider: &str, model: &str, f: impl FnOnce(&mut ModelState) -> R) -> R {
        let key = ModelKey {
            provider: provider.to_string(),
            model: model.to_string(),
        };
        let ceiling = self.ceiling_for(provider);
        let mut inner = self.inner.lock().expect("rate controller lock poisoned");
        let state = inner.entry(key).or_insert_with(|| ModelState::new(ceiling));
        state.prune(Instant::now(), Duration::from_millis(self.config.decay_ms));
        f(state)
    }

    /// A 429 was observed: halve the cap, floor 1
    pub fn record_429(&self, provider: &str, model: &str) {
        self.with_state(provider, model, |state| {
            state.recent_429s.push_back(Instant::now());
            state.consecutive_successes = 0;
            let before = state.current_max;
            state.current_max = (state.current_max / 2).max(1);
            info!(
                provider,
                model, before, after = state.current_max, "429 observed, cap halved"
            );
        });
    }

    /// A call completed cleanly; enough of these in a 429-free window earn
    /// an additive increase
    pub fn record_success(&self, provider: &str, model: &str) {
        let threshold = self.config.success_threshold.max(1);
        self.with_state(provider, model, |state| {
            state.consecutive_successes += 1;
            if state.consecutive_successes >= threshold && state.recent_429s.is_empty() {
                state.consecutive_successes = 0;
                if state.current_max < state.ceiling {
                    state.current_max += 1;
                    debug!(provider, model, cap = state.current_max, "cap raised");
                }
            }
        });
    }

    /// The learned cap for this (provider, model)
    pub fn current_max_concurrency(&self, provider: &str, model: &str) -> u32 {
        self.with_state(provider, model, |state| state.current_max)
    }

    /// Try to start a call under the learned cap; pair with [`Self::finish`]
    pub fn try_begin(&self, provider: &str, model: &str) -> bool {
        self.with_state(provider, model, |state| {
            if state.in_flight < state.current_max {
                state.in_flight += 1;
                true
            } else {
                false
            }
        })
    }

    /// A call started via [`Self::try_begin`] finished (any outcome)
    pub fn finish(&self, provider: &str, model: &str) {
        self.with_state(provider, model, |state| {
            if state.in_flight == 0 {
                debug!(provider, model, "finish without matching begin");
            }
            state.in_flight = state.in_flight.saturating_sub(1);
        });
    }

    /// Current view over every tracked (provider, model)
    pub fn limits(&self) -> Vec<ModelLimitView> {
        let now = Instant::now();
        let decay = Duration::from_millis(self.config.decay_ms);
        let mut inner = self.inner.lock().expect("rate controller lock poisoned");

        let mut views: Vec<_> = inner
            .iter_mut()
            .map(|(key, state)| {
                state.prune(now, decay);
                ModelLimitView {
                    provider: key.provider.clone(),
                    model: key.model.clone(),
                    current_max: state.current_max,
                    ceiling: state.ceiling,
                    in_flight: state.in_flight,
                    recent_429s: state.recent_429s.len(),
                }
            })
            .collect();
        views.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        views
    }

    /// Drop all learned state
    pub fn shutdown(&self) {
        self.inner.lock().expect("rate controller lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(decay_ms: u64) -> AdaptiveRateController {
        AdaptiveRateController::new(
            AdaptiveConfig {
                decay_ms,
                success_threshold: 5,
                default_ceiling: 8,
            },
            HashMap::from([("anthropic".to_string(), 8)]),
        )
    }

    #[test]
    fn test_429_halves_monotonically_to_one() {
        let c = controller(480_000);

        assert_eq!(c.current_max_concurrency("anthropic", "sonnet"), 8);
        c.record_429("anthropic", "sonnet");
        assert_eq!(c.current_max_concurrency("anthropic", "sonnet"), 4);
        c.record_429("anthropic", "sonnet");
        assert_eq!(c.current_max_concurrency("anthropic", "sonnet"), 2);
        c.record_429("anthropic", "sonnet");
        assert_eq!(c.current_max_concurrency("anthropic", "sonnet"), 1);
        c.record_429("anthropic", "sonnet");
        assert_eq!(c.current_max_concurrency("anthropic", "sonnet"), 1);
    }

    #[test]
    fn test_models_tracked_independently() {
        let c = controller(480_000);

        c.record_429("anthropic", "sonnet");
        assert_eq!(c.current_max_concurrency("anthropic", "sonnet"), 4);
        assert_eq!(c.current_max_concurrency("anthropic", "opus"), 8);
    }

    #[test]
    fn test_no_increase_while_429_in_window() {
        let c = controller(480_000);
        c.record_429("anthropic", "sonnet");
        assert_eq!(c.current_max_concurrency("anthropic", "sonnet"), 4);

        for _ in 0..50 {
            c.record_success("anthropic", "sonnet");
        }
        // The 429 is still in the window, so no recovery yet
        assert_eq!(c.current_max_concurrency("anthropic", "sonnet"), 4);
    }

    #[test]
    fn test_recovery_after_decay() {
        // Zero decay window: the 429 ages out immediately
        let c = controller(0);
        c.record_429("anthropic", "sonnet");
        assert_eq!(c.current_max_concurrency("anthropic", "sonnet"), 4);

        // 20 clean successes at threshold 5 earn four increases
        for _ in 0..20 {
            c.record_success("anthropic", "sonnet");
        }
        assert_eq!(c.current_max_concurrency("anthropic", "sonnet"), 8);
    }

    #[test]
    fn test_increase_capped_at_ceiling() {
        let c = controller(0);
        for _ in 0..100 {
            c.record_success("anthropic", "sonnet");
        }
        assert_eq!(c.current_max_concurrency("anthropic", "sonnet"), 8);
    }

    #[test]
    fn test_in_flight_gate() {
        let c = controller(480_000);
        for _ in 0..3 {
            c.record_429("anthropic", "sonnet");
        }
        assert_eq!(c.current_max_concurrency("anthropic", "sonnet"), 1);

        assert!(c.try_begin("anthropic", "sonnet"));
        assert!(!c.try_begin("anthropic", "sonnet"));
        c.finish("anthropic", "sonnet");
        assert!(c.try_begin("anthropic", "sonnet"));
    }

    #[test]
    fn test_unknown_provider_uses_default_ceiling() {
        let c = controller(480_000);
        assert_eq!(c.current_max_concurrency("mystery", "m1"), 8);
    }

    #[test]
    fn test_limits_view() {
        let c = controller(480_000);
        c.record_429("anthropic", "sonnet");
        assert!(c.try_begin("anthropic", "sonnet"));

        let views = c.limits();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].current_max, 4);
        assert_eq!(views[0].in_flight, 1);
        assert_eq!(views[0].recent_429s, 1);
    }

    #[test]
    fn test_finish_without_begin_is_safe() {
        let c = controller(480_000);
        c.finish("anthropic", "sonnet");
        assert!(c.try_begin("anthropic", "sonnet"));
    }
}
