//! Per-peer trust score with time decay, and a three-state circuit breaker.
//! Both are created lazily per peer in a `DashMap`-backed registry, mirroring
//! the teacher's `PorVerifier::peer_reputations: Arc<DashMap<...>>` and its
//! lazy state-check convention in `is_peer_penalized`.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::ReputationConfig;
use crate::types::now_ms;
use crate::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_ms: u64,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_ms: 0,
        }
    }

    /// Lazily applies the Open->HalfOpen transition if `reset_timeout` has
    /// elapsed since the last failure, then returns the (possibly updated)
    /// state.
    fn resolve_state(&mut self, reset_timeout_ms: u64) -> BreakerState {
        if self.state == BreakerState::Open
            && now_ms().saturating_sub(self.last_failure_ms) >= reset_timeout_ms
        {
            self.state = BreakerState::HalfOpen;
            self.consecutive_successes = 0;
        }
        self.state
    }

    fn record(&mut self, success: bool, config: &ReputationConfig) {
        let state = self.resolve_state(config.circuit_open_duration_ms);
        if success {
            match state {
                BreakerState::Closed => {
                    self.consecutive_failures = 0;
                }
                BreakerState::HalfOpen => {
                    self.consecutive_successes += 1;
                    if self.consecutive_successes >= config.circuit_half_open_probes.max(1) {
                        self.state = BreakerState::Closed;
                        self.consecutive_failures = 0;
                        self.consecutive_successes = 0;
                    }
                }
                BreakerState::Open => {}
            }
        } else {
            self.last_failure_ms = now_ms();
            match state {
                BreakerState::Closed => {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= config.circuit_failure_threshold {
                        self.state = BreakerState::Open;
                    }
                }
                BreakerState::HalfOpen => {
                    self.state = BreakerState::Open;
                    self.consecutive_successes = 0;
                }
                BreakerState::Open => {}
            }
        }
    }
}

/// Registry of per-peer circuit breakers. Each entry is protected by its own
/// lock (outer `DashMap` shards, per-breaker `Mutex` serializes its own
/// transitions), per the concurrency model's "outer map lock plus
/// per-breaker lock" design.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<NodeId, Mutex<BreakerEntry>>,
    config: ReputationConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn record(&self, peer: NodeId, success: bool) {
        let entry = self.breakers.entry(peer).or_insert_with(|| Mutex::new(BreakerEntry::new()));
        entry.lock().record(success, &self.config);
    }

    pub fn state(&self, peer: NodeId) -> BreakerState {
        let entry = self.breakers.entry(peer).or_insert_with(|| Mutex::new(BreakerEntry::new()));
        entry.lock().resolve_state(self.config.circuit_open_duration_ms)
    }

    pub fn is_open(&self, peer: NodeId) -> bool {
        self.state(peer) == BreakerState::Open
    }
}

struct ReputationEntry {
    score: f32,
    confidence: f32,
    sample_count: u32,
    last_update_ms: u64,
}

impl ReputationEntry {
    fn new(initial_score: f32) -> Self {
        Self {
            score: initial_score,
            confidence: 0.0,
            sample_count: 0,
            last_update_ms: now_ms(),
        }
    }

    /// Applies time-decay toward the neutral prior 0.5 since the last
    /// update, using the configured half-life, then records a new
    /// observation.
    fn record(&mut self, success: bool, latency_ms: u32, half_life_ms: u64) {
        self.apply_decay(half_life_ms);
        let outcome = if success {
            1.0 - latency_penalty(latency_ms)
        } else {
            0.0
        };
        // EWMA with a weight that shrinks as confidence (sample count) grows,
        // so early observations move the score quickly and later ones
        // refine it.
        let alpha = (1.0 / (1.0 + self.sample_count as f32)).max(0.05);
        self.score = self.score * (1.0 - alpha) + outcome * alpha;
        self.sample_count = self.sample_count.saturating_add(1);
        self.confidence = (self.sample_count as f32 / (self.sample_count as f32 + 10.0)).min(1.0);
        self.last_update_ms = now_ms();
    }

    fn apply_decay(&mut self, half_life_ms: u64) {
        if half_life_ms == 0 {
            return;
        }
        let elapsed = now_ms().saturating_sub(self.last_update_ms) as f64;
        let decay = 0.5f64.powf(elapsed / half_life_ms as f64);
        self.score = (self.score as f64 * decay + 0.5 * (1.0 - decay)) as f32;
        self.confidence = (self.confidence as f64 * decay) as f32;
    }
}

fn latency_penalty(latency_ms: u32) -> f32 {
    // Down-weights outlier-latency successes: negligible penalty below
    // 200ms, growing toward 0.5 by 2s.
    ((latency_ms as f32 - 200.0).max(0.0) / 3600.0).min(0.5)
}

pub struct ReputationTracker {
    entries: DashMap<NodeId, Mutex<ReputationEntry>>,
    config: ReputationConfig,
}

impl ReputationTracker {
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    pub fn record(&self, peer: NodeId, success: bool, latency_ms: u32) {
        let entry = self
            .entries
            .entry(peer)
            .or_insert_with(|| Mutex::new(ReputationEntry::new(self.config.initial_score)));
        entry.lock().record(success, latency_ms, self.config.decay_half_life_ms);
    }

    pub fn trust_score(&self, peer: NodeId) -> (f32, f32) {
        let entry = self
            .entries
            .entry(peer)
            .or_insert_with(|| Mutex::new(ReputationEntry::new(self.config.initial_score)));
        let mut guard = entry.lock();
        guard.apply_decay(self.config.decay_half_life_ms);
        (guard.score, guard.confidence)
    }

    pub fn average_score(&self) -> f32 {
        if self.entries.is_empty() {
            return self.config.initial_score;
        }
        let sum: f32 = self.entries.iter().map(|e| e.lock().score).sum();
        sum / self.entries.len() as f32
    }

    pub fn top_peers(&self, n: usize) -> Vec<(NodeId, f32)> {
        let mut scored: Vec<(NodeId, f32)> = self
            .entries
            .iter()
            .map(|e| (*e.key(), e.value().lock().score))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(n);
        scored
    }

    pub fn is_trusted(&self, peer: NodeId) -> bool {
        self.trust_score(peer).0 >= self.config.min_trusted_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_consecutive_failures_open_the_breaker() {
        let registry = CircuitBreakerRegistry::new(ReputationConfig::default());
        let peer = NodeId::random();
        for _ in 0..5 {
            registry.record(peer, false);
        }
        assert!(registry.is_open(peer));
    }

    #[test]
    fn half_open_failure_returns_to_open() {
        let mut config = ReputationConfig::default();
        config.circuit_open_duration_ms = 0; // transitions immediately on next read
        let registry = CircuitBreakerRegistry::new(config);
        let peer = NodeId::random();
        for _ in 0..5 {
            registry.record(peer, false);
        }
        assert_eq!(registry.state(peer), BreakerState::HalfOpen);
        registry.record(peer, false);
        assert_eq!(registry.state(peer), BreakerState::Open);
    }

    #[test]
    fn half_open_successes_close_the_breaker() {
        let mut config = ReputationConfig::default();
        config.circuit_open_duration_ms = 0;
        config.circuit_half_open_probes = 3;
        let registry = CircuitBreakerRegistry::new(config);
        let peer = NodeId::random();
        for _ in 0..5 {
            registry.record(peer, false);
        }
        assert_eq!(registry.state(peer), BreakerState::HalfOpen);
        registry.record(peer, true);
        registry.record(peer, true);
        registry.record(peer, true);
        assert_eq!(registry.state(peer), BreakerState::Closed);
    }

    #[test]
    fn reputation_score_improves_with_successes() {
        let tracker = ReputationTracker::new(ReputationConfig::default());
        let peer = NodeId::random();
        let (initial, _) = tracker.trust_score(peer);
        for _ in 0..20 {
            tracker.record(peer, true, 20);
        }
        let (after, confidence) = tracker.trust_score(peer);
        assert!(after >= initial);
        assert!(confidence > 0.0);
    }

    #[test]
    fn top_peers_orders_by_score_descending() {
        let tracker = ReputationTracker::new(ReputationConfig::default());
        let good = NodeId::random();
        let bad = NodeId::random();
        for _ in 0..10 {
            tracker.record(good, true, 10);
            tracker.record(bad, false, 500);
        }
        let top = tracker.top_peers(2);
        assert_eq!(top[0].0, good);
    }
}
