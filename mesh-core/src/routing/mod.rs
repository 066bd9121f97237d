//! Kademlia-style routing table and iterative lookup, grounded on the
//! peer-scoring and retry patterns in the distributed inference module this
//! crate's reputation and selection logic descends from.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::RoutingConfig;
use crate::error::{MeshError, Result};
use crate::types::{NodeId, PeerInfo};

mod store;
pub use store::DhtStore;

/// A single k-bucket: peers ordered least-recently-seen first, per the
/// classic Kademlia eviction policy (touch moves a peer to the back).
#[derive(Debug, Default)]
struct Bucket {
    peers: VecDeque<PeerInfo>,
}

impl Bucket {
    fn touch_or_insert(&mut self, peer: PeerInfo, k: usize) -> Option<PeerInfo> {
        if let Some(pos) = self.peers.iter().position(|p| p.node_id == peer.node_id) {
            self.peers.remove(pos);
            self.peers.push_back(peer);
            return None;
        }
        if self.peers.len() < k {
            self.peers.push_back(peer);
            None
        } else {
            // Bucket full: caller decides whether to evict the least-recently-seen
            // entry (e.g. after a failed liveness probe) or drop the newcomer.
            Some(peer)
        }
    }

    fn remove(&mut self, node_id: &NodeId) -> bool {
        if let Some(pos) = self.peers.iter().position(|p| &p.node_id == node_id) {
            self.peers.remove(pos);
            true
        } else {
            false
        }
    }

    fn least_recently_seen(&self) -> Option<&PeerInfo> {
        self.peers.front()
    }
}

/// Number of buckets in a 160-bit key space.
const NUM_BUCKETS: usize = 160;

/// Routing table of 160 k-buckets, indexed by XOR-distance bucket index
/// relative to the local node id.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<RwLock<Bucket>>,
    config: RoutingConfig,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, config: RoutingConfig) -> Self {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        for _ in 0..NUM_BUCKETS {
            buckets.push(RwLock::new(Bucket::default()));
        }
        Self {
            local_id,
            buckets,
            config,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Inserts or refreshes a peer. Returns the peer evicted from the
    /// bucket if it was full and its least-recently-seen entry should be
    /// probed for liveness before the caller retries the insert.
    pub fn insert(&self, peer: PeerInfo) -> Result<Option<PeerInfo>> {
        if peer.node_id == self.local_id {
            return Err(MeshError::InvalidPeerId {
                peer_id: peer.node_id.to_string(),
                context: Default::default(),
            });
        }
        let idx = self.local_id.bucket_index(&peer.node_id);
        let mut bucket = self.buckets[idx].write();
        if let Some(overflow) = bucket.touch_or_insert(peer, self.config.k) {
            return Ok(bucket.least_recently_seen().cloned().map(|stale| {
                tracing::debug!(stale_peer = %stale.node_id, incoming = %overflow.node_id, "bucket full, candidate for eviction probe");
                overflow
            }));
        }
        Ok(None)
    }

    pub fn remove(&self, node_id: &NodeId) {
        let idx = self.local_id.bucket_index(node_id);
        self.buckets[idx].write().remove(node_id);
    }

    /// Evicts the stalest peer in `node_id`'s bucket, making room for a
    /// pending insert after a failed liveness probe.
    pub fn evict_stale(&self, node_id: &NodeId) {
        let idx = self.local_id.bucket_index(node_id);
        let mut bucket = self.buckets[idx].write();
        if let Some(stale) = bucket.peers.pop_front() {
            tracing::debug!(peer = %stale.node_id, "evicted stale bucket entry");
        }
    }

    /// Returns up to `count` peers closest to `target`, across all buckets.
    pub fn closest_peers(&self, target: &NodeId, count: usize) -> Vec<PeerInfo> {
        let mut all: Vec<PeerInfo> = self
            .buckets
            .iter()
            .flat_map(|b| b.read().peers.iter().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by_key(|p| p.node_id.xor_distance(target));
        all.truncate(count);
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trait the routing table's iterative lookup uses to query remote peers;
/// implemented atop the crate's `Transport` external interface.
#[async_trait::async_trait]
pub trait LookupQuerier: Send + Sync {
    async fn find_node(&self, peer: &PeerInfo, target: &NodeId) -> Result<Vec<PeerInfo>>;
}

/// Runs an iterative FIND_NODE lookup with concurrency `alpha`, returning
/// the `k` closest peers discovered, most-converged first.
pub async fn iterative_find_node(
    table: &Arc<RoutingTable>,
    querier: &dyn LookupQuerier,
    target: &NodeId,
) -> Result<Vec<PeerInfo>> {
    let k = table.config.k;
    let alpha = table.config.alpha;

    let mut shortlist = table.closest_peers(target, k);
    if shortlist.is_empty() {
        return Err(MeshError::InsufficientPeers {
            required: 1,
            available: 0,
            context: Default::default(),
        });
    }

    let mut queried = std::collections::HashSet::new();
    let mut closest_distance = shortlist
        .first()
        .map(|p| p.node_id.xor_distance(target))
        .unwrap();

    loop {
        let to_query: Vec<PeerInfo> = shortlist
            .iter()
            .filter(|p| !queried.contains(&p.node_id))
            .take(alpha)
            .cloned()
            .collect();

        if to_query.is_empty() {
            break;
        }

        let mut discovered = Vec::new();
        for peer in &to_query {
            queried.insert(peer.node_id);
            match querier.find_node(peer, target).await {
                Ok(peers) => discovered.extend(peers),
                Err(e) => {
                    tracing::debug!(peer = %peer.node_id, error = %e, "find_node query failed");
                }
            }
        }

        for peer in discovered {
            if peer.node_id != table.local_id() && !shortlist.iter().any(|p| p.node_id == peer.node_id) {
                shortlist.push(peer);
            }
        }
        shortlist.sort_by_key(|p| p.node_id.xor_distance(target));
        shortlist.truncate(k);

        let new_closest = shortlist
            .first()
            .map(|p| p.node_id.xor_distance(target))
            .unwrap_or(closest_distance);
        if new_closest >= closest_distance && queried.len() >= shortlist.len() {
            break;
        }
        closest_distance = new_closest;
    }

    Ok(shortlist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;

    fn peer(id: NodeId) -> PeerInfo {
        PeerInfo::new(id, "127.0.0.1:0")
    }

    #[test]
    fn insert_and_closest_peers() {
        let local = NodeId::random();
        let table = RoutingTable::new(local, RoutingConfig::default());
        let mut ids = Vec::new();
        for _ in 0..10 {
            let id = NodeId::random();
            ids.push(id);
            table.insert(peer(id)).unwrap();
        }
        assert_eq!(table.len(), 10);
        let target = ids[0];
        let closest = table.closest_peers(&target, 3);
        assert_eq!(closest[0].node_id, target);
    }

    #[test]
    fn rejects_self_insert() {
        let local = NodeId::random();
        let table = RoutingTable::new(local, RoutingConfig::default());
        assert!(table.insert(peer(local)).is_err());
    }

    #[test]
    fn full_bucket_returns_overflow_candidate() {
        let local = NodeId([0u8; 20]);
        let mut config = RoutingConfig::default();
        config.k = 2;
        let table = RoutingTable::new(local, config);
        // Three ids that land in the same bucket (same leading byte pattern
        // relative to an all-zero local id: bucket index = 159 for any id
        // whose top bit is set).
        let mut make_id = |last_byte: u8| {
            let mut bytes = [0u8; 20];
            bytes[0] = 0x80;
            bytes[19] = last_byte;
            NodeId(bytes)
        };
        let a = make_id(1);
        let b = make_id(2);
        let c = make_id(3);
        table.insert(peer(a)).unwrap();
        table.insert(peer(b)).unwrap();
        let overflow = table.insert(peer(c)).unwrap();
        assert!(overflow.is_some());
    }

    struct MockQuerier {
        responses: std::collections::HashMap<NodeId, Vec<PeerInfo>>,
    }

    #[async_trait::async_trait]
    impl LookupQuerier for MockQuerier {
        async fn find_node(&self, peer: &PeerInfo, _target: &NodeId) -> Result<Vec<PeerInfo>> {
            Ok(self.responses.get(&peer.node_id).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn iterative_lookup_converges() {
        let local = NodeId::random();
        let table = Arc::new(RoutingTable::new(local, RoutingConfig::default()));
        let bootstrap = NodeId::random();
        let target = NodeId::random();
        let discovered = NodeId::random();

        table.insert(peer(bootstrap)).unwrap();

        let mut responses = std::collections::HashMap::new();
        responses.insert(bootstrap, vec![peer(discovered)]);
        let querier = MockQuerier { responses };

        let result = iterative_find_node(&table, &querier, &target).await.unwrap();
        assert!(result.iter().any(|p| p.node_id == discovered));
    }
}
