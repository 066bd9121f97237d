//! Chunk-to-peers LRU cache and time-decayed demand tracker, generalized
//! from the teacher's `SmartCache`/`CacheMetrics` (`ml/src/p2p/cache.rs`) to
//! the confidence-scored `ChunkPeerMapping` semantics this spec needs —
//! `moka::Cache` doesn't expose a per-entry confidence field, so this is a
//! hand-rolled structure pairing an index map with explicit recency
//! bookkeeping, in the teacher's habit of combining a `DashMap` index with a
//! recency list.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::config::CacheConfig;
use crate::types::{now_ms, ChunkHash, NodeId};

#[derive(Debug, Clone)]
pub struct ChunkPeerMapping {
    pub chunk_hash: ChunkHash,
    pub peer_ids: Vec<NodeId>,
    pub last_updated_ms: u64,
    pub confidence: f32,
}

impl ChunkPeerMapping {
    fn new(chunk_hash: ChunkHash, peer_ids: Vec<NodeId>) -> Self {
        Self {
            chunk_hash,
            peer_ids,
            last_updated_ms: now_ms(),
            confidence: 0.5,
        }
    }

    fn is_expired(&self, ttl_ms: u64) -> bool {
        now_ms().saturating_sub(self.last_updated_ms) > ttl_ms
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f32 / total as f32
        }
    }
}

struct Inner {
    entries: HashMap<ChunkHash, ChunkPeerMapping>,
    recency: VecDeque<ChunkHash>,
    metrics: CacheMetrics,
}

impl Inner {
    fn touch_recency(&mut self, hash: &ChunkHash) {
        if let Some(pos) = self.recency.iter().position(|h| h == hash) {
            self.recency.remove(pos);
        }
        self.recency.push_back(*hash);
    }
}

/// LRU keyed by chunk hash, with TTL eviction and a growable per-entry
/// confidence score.
pub struct ChunkCache {
    inner: Mutex<Inner>,
    config: CacheConfig,
}

impl ChunkCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: VecDeque::new(),
                metrics: CacheMetrics::default(),
            }),
            config,
        }
    }

    pub fn get(&self, hash: &ChunkHash) -> Option<ChunkPeerMapping> {
        let mut inner = self.inner.lock();
        let expired = inner
            .entries
            .get(hash)
            .map(|m| m.is_expired(self.config.entry_ttl_ms))
            .unwrap_or(false);
        if expired {
            inner.entries.remove(hash);
            inner.recency.retain(|h| h != hash);
            inner.metrics.misses += 1;
            return None;
        }
        if inner.entries.contains_key(hash) {
            inner.touch_recency(hash);
            inner.metrics.hits += 1;
            inner.entries.get(hash).cloned()
        } else {
            inner.metrics.misses += 1;
            None
        }
    }

    pub fn put(&self, hash: ChunkHash, peer_ids: Vec<NodeId>) {
        let mut inner = self.inner.lock();
        self.evict_to_capacity(&mut inner);
        if let Some(existing) = inner.entries.get_mut(&hash) {
            existing.peer_ids = peer_ids;
            existing.last_updated_ms = now_ms();
        } else {
            inner.entries.insert(hash, ChunkPeerMapping::new(hash, peer_ids));
        }
        inner.touch_recency(&hash);
    }

    /// Records an additional provider for a chunk, bumping confidence by
    /// 0.1 (capped at 1.0) and extending the TTL.
    pub fn add_peer(&self, hash: ChunkHash, peer: NodeId) {
        let mut inner = self.inner.lock();
        self.evict_to_capacity(&mut inner);
        let entry = inner
            .entries
            .entry(hash)
            .or_insert_with(|| ChunkPeerMapping::new(hash, Vec::new()));
        if !entry.peer_ids.contains(&peer) {
            entry.peer_ids.push(peer);
        }
        entry.confidence = (entry.confidence + 0.1).min(1.0);
        entry.last_updated_ms = now_ms();
        inner.touch_recency(&hash);
    }

    pub fn remove(&self, hash: &ChunkHash) {
        let mut inner = self.inner.lock();
        inner.entries.remove(hash);
        inner.recency.retain(|h| h != hash);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    pub fn cleanup_expired(&self) {
        let mut inner = self.inner.lock();
        let ttl = self.config.entry_ttl_ms;
        let expired: Vec<ChunkHash> = inner
            .entries
            .iter()
            .filter(|(_, v)| v.is_expired(ttl))
            .map(|(k, _)| *k)
            .collect();
        for hash in expired {
            inner.entries.remove(&hash);
            inner.recency.retain(|h| h != &hash);
            inner.metrics.evictions += 1;
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.inner.lock().metrics
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_to_capacity(&self, inner: &mut Inner) {
        while inner.entries.len() >= self.config.max_entries {
            if let Some(oldest) = inner.recency.pop_front() {
                inner.entries.remove(&oldest);
                inner.metrics.evictions += 1;
            } else {
                break;
            }
        }
    }
}

/// Demand tracker: access counts with exponential time decay, feeding the
/// adaptive allocator's demand multiplier and the tier re-evaluation epoch
/// tick.
pub struct DemandTracker {
    entries: Mutex<HashMap<ChunkHash, DemandEntry>>,
    half_life_ms: u64,
}

struct DemandEntry {
    score: f32,
    last_access_ms: u64,
}

impl DemandTracker {
    pub fn new(half_life_ms: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            half_life_ms,
        }
    }

    pub fn record_access(&self, hash: ChunkHash) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(hash).or_insert(DemandEntry {
            score: 0.0,
            last_access_ms: now_ms(),
        });
        Self::decay_entry(entry, self.half_life_ms);
        entry.score = (entry.score + 1.0).min(100.0);
        entry.last_access_ms = now_ms();
    }

    /// Demand score in [0, 1], normalizing the decayed raw access count.
    pub fn demand_score(&self, hash: &ChunkHash) -> f32 {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(hash) else {
            return 0.0;
        };
        Self::decay_entry(entry, self.half_life_ms);
        (entry.score / 10.0).min(1.0)
    }

    pub fn decay_all(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            Self::decay_entry(entry, self.half_life_ms);
        }
        entries.retain(|_, e| e.score > 0.01);
    }

    fn decay_entry(entry: &mut DemandEntry, half_life_ms: u64) {
        if half_life_ms == 0 {
            return;
        }
        let elapsed = now_ms().saturating_sub(entry.last_access_ms) as f64;
        let decay = 0.5f64.powf(elapsed / half_life_ms as f64);
        entry.score = (entry.score as f64 * decay) as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_peer_increments_confidence_and_caps_at_one() {
        let cache = ChunkCache::new(CacheConfig::default());
        let hash = ChunkHash::of(b"x");
        for _ in 0..20 {
            cache.add_peer(hash, NodeId::random());
        }
        let mapping = cache.get(&hash).unwrap();
        assert!((mapping.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn lru_evicts_oldest_over_capacity() {
        let mut config = CacheConfig::default();
        config.max_entries = 2;
        let cache = ChunkCache::new(config);
        let a = ChunkHash::of(b"a");
        let b = ChunkHash::of(b"b");
        let c = ChunkHash::of(b"c");
        cache.put(a, vec![]);
        cache.put(b, vec![]);
        cache.put(c, vec![]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a).is_none());
        assert!(cache.get(&c).is_some());
    }

    #[test]
    fn hit_rate_reflects_gets() {
        let cache = ChunkCache::new(CacheConfig::default());
        let hash = ChunkHash::of(b"x");
        cache.put(hash, vec![]);
        cache.get(&hash);
        cache.get(&ChunkHash::of(b"missing"));
        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert!((metrics.hit_rate() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn demand_score_increases_with_repeated_access() {
        let tracker = DemandTracker::new(600_000);
        let hash = ChunkHash::of(b"hot");
        for _ in 0..5 {
            tracker.record_access(hash);
        }
        assert!(tracker.demand_score(&hash) > 0.0);
    }
}
