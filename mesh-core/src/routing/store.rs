//! DHT value store: chunk_hash -> provider node-ids with per-entry TTL.
//! Distinct from `RoutingTable` (which routes toward node ids); this is
//! the `FindPeers`/`Store` side of the DHT the coordinator calls into
//! when locating chunk providers.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::types::{now_ms, ChunkHash, NodeId};

#[derive(Debug, Clone, Copy)]
struct ProviderEntry {
    peer: NodeId,
    expires_at_ms: u64,
}

#[derive(Default)]
pub struct DhtStore {
    entries: RwLock<HashMap<ChunkHash, Vec<ProviderEntry>>>,
}

impl DhtStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `peer` as a provider of `hash` for `ttl_seconds`, replacing
    /// any existing entry for the same peer rather than duplicating it.
    pub fn store(&self, hash: ChunkHash, peer: NodeId, ttl_seconds: u64) {
        let mut entries = self.entries.write();
        let providers = entries.entry(hash).or_default();
        let expires_at_ms = now_ms() + ttl_seconds * 1_000;
        if let Some(existing) = providers.iter_mut().find(|p| p.peer == peer) {
            existing.expires_at_ms = expires_at_ms;
        } else {
            providers.push(ProviderEntry { peer, expires_at_ms });
        }
    }

    /// Returns the live (non-expired) providers of `hash`.
    pub fn find_peers(&self, hash: &ChunkHash) -> Vec<NodeId> {
        let now = now_ms();
        let entries = self.entries.read();
        entries
            .get(hash)
            .map(|providers| {
                providers
                    .iter()
                    .filter(|p| p.expires_at_ms > now)
                    .map(|p| p.peer)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove_provider(&self, hash: &ChunkHash, peer: &NodeId) {
        let mut entries = self.entries.write();
        if let Some(providers) = entries.get_mut(hash) {
            providers.retain(|p| &p.peer != peer);
            if providers.is_empty() {
                entries.remove(hash);
            }
        }
    }

    /// Drops expired provider entries; call periodically from a background
    /// loop rather than on every read.
    pub fn cleanup_expired(&self) {
        let now = now_ms();
        let mut entries = self.entries.write();
        entries.retain(|_, providers| {
            providers.retain(|p| p.expires_at_ms > now);
            !providers.is_empty()
        });
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_finds_providers() {
        let store = DhtStore::new();
        let hash = ChunkHash::of(b"chunk");
        let peer = NodeId::random();
        store.store(hash, peer, 60);
        assert_eq!(store.find_peers(&hash), vec![peer]);
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let store = DhtStore::new();
        let hash = ChunkHash::of(b"chunk");
        let peer = NodeId::random();
        store.store(hash, peer, 0);
        assert!(store.find_peers(&hash).is_empty());
    }

    #[test]
    fn cleanup_removes_expired_entries() {
        let store = DhtStore::new();
        let hash = ChunkHash::of(b"chunk");
        let peer = NodeId::random();
        store.store(hash, peer, 0);
        store.cleanup_expired();
        assert_eq!(store.entry_count(), 0);
    }

    #[test]
    fn re_storing_same_peer_refreshes_rather_than_duplicates() {
        let store = DhtStore::new();
        let hash = ChunkHash::of(b"chunk");
        let peer = NodeId::random();
        store.store(hash, peer, 60);
        store.store(hash, peer, 60);
        assert_eq!(store.find_peers(&hash).len(), 1);
    }
}
