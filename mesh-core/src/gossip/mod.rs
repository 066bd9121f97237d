//! Epidemic gossip manager: signed dissemination, Bloom-filter dedup with
//! TTL eviction, per-sender rate limiting, a bounded priority outbound
//! queue, and Merkle-based anti-entropy. Grounded on the teacher's
//! `PorVerifier` (DashMap-per-peer state, lazy checks) and the
//! `other_examples` Dytallix gossip module (per-peer throttle/queue split).

pub mod bloom;
pub mod canonical;

use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::GossipConfig;
use crate::error::{MeshError, Result};
use crate::merkle::{diff_leaf_keys, MerkleTree};
use crate::routing::RoutingTable;
use crate::transport::SharedTransport;
use crate::types::{now_ms, NodeId};

use bloom::BloomFilter;
use canonical::{message_id, signing_bytes};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    pub id: String,
    pub sender: NodeId,
    pub msg_type: String,
    pub timestamp_ns: u64,
    pub payload: Value,
    pub hop_count: u32,
    pub max_hops: u32,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl GossipMessage {
    pub fn sign_new(
        signing_key: &SigningKey,
        sender: NodeId,
        msg_type: impl Into<String>,
        payload: Value,
        max_hops: u32,
    ) -> Self {
        let msg_type = msg_type.into();
        let timestamp_ns = now_ms() * 1_000_000;
        let hop_count = 0;
        let bytes = signing_bytes(&msg_type, &sender.to_hex(), timestamp_ns, hop_count, max_hops, &payload);
        let signature = signing_key.sign(&bytes);
        let id = message_id(&msg_type, &sender.to_hex(), timestamp_ns, &payload);
        Self {
            id,
            sender,
            msg_type,
            timestamp_ns,
            payload,
            hop_count,
            max_hops,
            signature: signature.to_bytes().to_vec(),
            public_key: signing_key.verifying_key().to_bytes().to_vec(),
        }
    }

    fn recomputed_id(&self) -> String {
        message_id(&self.msg_type, &self.sender.to_hex(), self.timestamp_ns, &self.payload)
    }

    pub fn verify_signature(&self) -> bool {
        let Ok(pk_bytes): std::result::Result<[u8; 32], _> = self.public_key.clone().try_into() else {
            return false;
        };
        let Ok(sig_bytes): std::result::Result<[u8; 64], _> = self.signature.clone().try_into() else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&pk_bytes) else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_bytes);
        // Signature is computed over hop_count=0 at mint time; re-derive the
        // same bytes the sender signed, not the current (possibly forwarded)
        // hop_count.
        let bytes = signing_bytes(
            &self.msg_type,
            &self.sender.to_hex(),
            self.timestamp_ns,
            0,
            self.max_hops,
            &self.payload,
        );
        verifying_key.verify(&bytes, &signature).is_ok()
    }

    fn priority(&self) -> u8 {
        match self.msg_type.as_str() {
            "chunk_announce" => 2,
            "peer_capability" => 1,
            _ => 0,
        }
    }
}

struct QueuedMessage {
    priority: u8,
    seq: u64,
    message: GossipMessage,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedMessage {}
impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_ms: f64,
    last_refill_ms: u64,
}

impl TokenBucket {
    fn new(capacity: u32, rate_per_sec: u32) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_per_ms: rate_per_sec as f64 / 1000.0,
            last_refill_ms: now_ms(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = now_ms();
        let elapsed = now.saturating_sub(self.last_refill_ms) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_ms).min(self.capacity);
        self.last_refill_ms = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct SeenSet {
    bloom: BloomFilter,
    timestamps: HashMap<String, u64>,
    ttl_ms: u64,
    expected_items: usize,
    fp_rate: f64,
}

impl SeenSet {
    fn new(expected_items: usize, fp_rate: f64, ttl_ms: u64) -> Self {
        Self {
            bloom: BloomFilter::new(expected_items, fp_rate),
            timestamps: HashMap::new(),
            ttl_ms,
            expected_items,
            fp_rate,
        }
    }

    /// Returns true if the id was already seen (duplicate). Otherwise marks
    /// it seen and returns false.
    fn check_and_mark(&mut self, id: &str) -> bool {
        if self.timestamps.contains_key(id) || self.bloom.contains(id.as_bytes()) {
            return true;
        }
        self.bloom.insert(id.as_bytes());
        self.timestamps.insert(id.to_string(), now_ms());
        false
    }

    fn cleanup_expired(&mut self) {
        let now = now_ms();
        self.timestamps.retain(|_, ts| now.saturating_sub(*ts) < self.ttl_ms);
        if self.timestamps.is_empty() {
            self.bloom = BloomFilter::new(self.expected_items, self.fp_rate);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GossipHealth {
    pub peer_count: usize,
    pub queue_utilization: f32,
    pub send_recv_rate: f32,
    pub healthy: bool,
}

pub type Handler = Arc<dyn Fn(&GossipMessage) + Send + Sync>;

pub struct GossipManager {
    local_id: NodeId,
    signing_key: SigningKey,
    config: GossipConfig,
    transport: SharedTransport,
    routing: Arc<RoutingTable>,
    seen: RwLock<SeenSet>,
    rate_limiters: DashMap<NodeId, TokenBucket>,
    handlers: DashMap<String, Handler>,
    outbound_queue: Mutex<BinaryHeap<QueuedMessage>>,
    queue_seq: AtomicU64,
    dropped_count: AtomicU64,
    recent_messages: RwLock<VecDeque<GossipMessage>>,
    merkle: RwLock<MerkleTree>,
    sync_in_progress: DashMap<NodeId, ()>,
    send_count: AtomicU64,
    recv_count: AtomicU64,
    started_at_ms: u64,
    handler_invocations: AtomicU64,
}

impl GossipManager {
    pub fn new(
        local_id: NodeId,
        signing_key: SigningKey,
        config: GossipConfig,
        transport: SharedTransport,
        routing: Arc<RoutingTable>,
    ) -> Self {
        let seen = SeenSet::new(config.bloom_expected_items, config.bloom_false_positive_rate, config.seen_ttl_ms);
        Self {
            local_id,
            signing_key,
            config,
            transport,
            routing,
            seen: RwLock::new(seen),
            rate_limiters: DashMap::new(),
            handlers: DashMap::new(),
            outbound_queue: Mutex::new(BinaryHeap::new()),
            queue_seq: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
            recent_messages: RwLock::new(VecDeque::new()),
            merkle: RwLock::new(MerkleTree::new()),
            sync_in_progress: DashMap::new(),
            send_count: AtomicU64::new(0),
            recv_count: AtomicU64::new(0),
            started_at_ms: now_ms(),
            handler_invocations: AtomicU64::new(0),
        }
    }

    pub fn register_handler(&self, msg_type: impl Into<String>, handler: Handler) {
        self.handlers.insert(msg_type.into(), handler);
    }

    pub fn announce_chunk(&self, chunk_hash: &str) -> Result<()> {
        let payload = serde_json::json!({ "chunk_hash": chunk_hash });
        self.broadcast_internal("chunk_announce", payload)
    }

    pub fn announce_peer_capability(&self, payload: Value) -> Result<()> {
        self.broadcast_internal("peer_capability", payload)
    }

    pub fn broadcast(&self, topic: &str, payload: Value) -> Result<()> {
        self.broadcast_internal(topic, payload)
    }

    fn broadcast_internal(&self, msg_type: &str, payload: Value) -> Result<()> {
        let msg = GossipMessage::sign_new(
            &self.signing_key,
            self.local_id,
            msg_type,
            payload,
            default_max_hops(),
        );
        self.enqueue(msg.clone());
        self.seen.write().check_and_mark(&msg.id);
        self.merkle.write().insert(msg.id.clone(), msg.id.as_bytes());
        self.recent_messages.write().push_back(msg);
        while self.recent_messages.read().len() > 256 {
            self.recent_messages.write().pop_front();
        }
        Ok(())
    }

    fn enqueue(&self, message: GossipMessage) {
        let mut queue = self.outbound_queue.lock();
        if queue.len() >= self.config.max_outbound_per_peer.max(1000) {
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let seq = self.queue_seq.fetch_add(1, Ordering::Relaxed);
        queue.push(QueuedMessage {
            priority: message.priority(),
            seq,
            message,
        });
    }

    /// Processes an incoming message through the full receive pipeline.
    /// Returns `Ok(true)` if the handler ran, `Ok(false)` if it was
    /// rate-limited or otherwise silently dropped, and `Err` on a duplicate
    /// or invalid message.
    pub fn receive_message(&self, msg: GossipMessage) -> Result<bool> {
        self.recv_count.fetch_add(1, Ordering::Relaxed);

        let allowed = {
            let mut entry = self
                .rate_limiters
                .entry(msg.sender)
                .or_insert_with(|| TokenBucket::new(self.config.rate_limit_burst, self.config.rate_limit_per_sec));
            entry.try_consume()
        };
        if !allowed {
            return Ok(false);
        }

        let recomputed = msg.recomputed_id();
        if recomputed != msg.id {
            return Err(MeshError::SignatureInvalid {
                message_id: msg.id.clone(),
                context: Default::default(),
            });
        }

        if !msg.verify_signature() {
            return Err(MeshError::SignatureInvalid {
                message_id: msg.id.clone(),
                context: Default::default(),
            });
        }

        if msg.hop_count >= msg.max_hops {
            return Err(MeshError::MessageExpired {
                message_id: msg.id.clone(),
                context: Default::default(),
            });
        }

        // Only a message that already passed signature and hop validation
        // marks its id seen, so a forged or over-hop message sharing an id
        // with a later legitimate one can't shadow it as a duplicate.
        let is_duplicate = self.seen.write().check_and_mark(&msg.id);
        if is_duplicate {
            return Err(MeshError::DuplicateId {
                id: msg.id.clone(),
                context: Default::default(),
            });
        }

        self.merkle.write().insert(msg.id.clone(), msg.id.as_bytes());

        if let Some(handler) = self.handlers.get(&msg.msg_type) {
            handler(&msg);
            self.handler_invocations.fetch_add(1, Ordering::Relaxed);
        }

        if msg.hop_count < msg.max_hops.saturating_sub(1) {
            let mut forwarded = msg.clone();
            forwarded.hop_count += 1;
            self.enqueue(forwarded);
        }

        Ok(true)
    }

    /// Push round: sends up to `push_factor` recent messages to `push_factor`
    /// random peers.
    pub async fn push_round(&self) -> Result<()> {
        let peers = self.routing.closest_peers(&NodeId::random(), self.config.fanout);
        let recent: Vec<GossipMessage> = self.recent_messages.read().iter().rev().take(16).cloned().collect();
        for peer in peers {
            for msg in &recent {
                let bytes = bincode::serialize(msg).map_err(|e| MeshError::Serialization {
                    message: e.to_string(),
                    context: Default::default(),
                })?;
                if self.transport.send_message(&peer.node_id, bytes).await.is_ok() {
                    self.send_count.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// Pull round: requests recent ids from random peers and would fetch any
    /// missing ones (the actual RPC round-trip is a `Transport` concern; this
    /// records the intent for metrics/testing purposes).
    pub async fn pull_round(&self) -> Result<()> {
        let peers = self.routing.closest_peers(&NodeId::random(), self.config.fanout);
        for peer in peers {
            let _ = self.transport.ping(&peer.node_id, Duration::from_secs(2)).await;
        }
        Ok(())
    }

    /// Anti-entropy: reconciles against a known remote Merkle root + leaf id
    /// set, returning the ids this node has but the remote is missing.
    pub fn anti_entropy_diff(&self, peer: NodeId, remote_root: Option<String>, remote_ids: &[String]) -> Vec<String> {
        if self.sync_in_progress.contains_key(&peer) {
            return Vec::new();
        }
        self.sync_in_progress.insert(peer, ());
        let local_root = self.merkle.read().root();
        let diff = if local_root == remote_root {
            Vec::new()
        } else {
            diff_leaf_keys(&self.merkle.read(), remote_ids)
        };
        self.sync_in_progress.remove(&peer);
        diff
    }

    pub fn cleanup_expired(&self) {
        self.seen.write().cleanup_expired();
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    pub fn handler_invocations(&self) -> u64 {
        self.handler_invocations.load(Ordering::Relaxed)
    }

    pub fn health(&self) -> GossipHealth {
        let peer_count = self.routing.len();
        let queue_len = self.outbound_queue.lock().len();
        let capacity = self.config.max_outbound_per_peer.max(1000) as f32;
        let queue_utilization = queue_len as f32 / capacity;
        let uptime_secs = ((now_ms() - self.started_at_ms).max(1)) as f32 / 1000.0;
        let send_recv_rate =
            (self.send_count.load(Ordering::Relaxed) + self.recv_count.load(Ordering::Relaxed)) as f32 / uptime_secs;
        let healthy = peer_count >= 1 && queue_utilization < 0.5 && send_recv_rate > 0.1;
        GossipHealth {
            peer_count,
            queue_utilization,
            send_recv_rate,
            healthy,
        }
    }
}

fn default_max_hops() -> u32 {
    6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use crate::transport::MockTransport;

    fn manager() -> GossipManager {
        let local_id = NodeId::random();
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let routing = Arc::new(RoutingTable::new(local_id, RoutingConfig::default()));
        let transport = Arc::new(MockTransport::new());
        GossipManager::new(local_id, signing_key, GossipConfig::default(), transport, routing)
    }

    #[test]
    fn duplicate_message_handled_at_most_once() {
        let mgr = manager();
        let invocations = Arc::new(AtomicU64::new(0));
        let counter = invocations.clone();
        mgr.register_handler(
            "chunk_announce",
            Arc::new(move |_msg: &GossipMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let sender_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let sender_id = NodeId::from_public_key(sender_key.verifying_key().as_bytes());
        let msg = GossipMessage::sign_new(
            &sender_key,
            sender_id,
            "chunk_announce",
            serde_json::json!({"chunk_hash": "abc"}),
            6,
        );

        assert!(mgr.receive_message(msg.clone()).unwrap());
        assert!(mgr.receive_message(msg).is_err());
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let mgr = manager();
        let sender_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let sender_id = NodeId::from_public_key(sender_key.verifying_key().as_bytes());
        let mut msg = GossipMessage::sign_new(
            &sender_key,
            sender_id,
            "chunk_announce",
            serde_json::json!({"chunk_hash": "abc"}),
            6,
        );
        msg.signature[0] ^= 0xFF;
        assert!(mgr.receive_message(msg).is_err());
    }

    #[test]
    fn rejected_message_does_not_shadow_a_later_legitimate_one_with_the_same_id() {
        let mgr = manager();
        let invocations = Arc::new(AtomicU64::new(0));
        let counter = invocations.clone();
        mgr.register_handler(
            "chunk_announce",
            Arc::new(move |_msg: &GossipMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let sender_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let sender_id = NodeId::from_public_key(sender_key.verifying_key().as_bytes());
        let msg = GossipMessage::sign_new(
            &sender_key,
            sender_id,
            "chunk_announce",
            serde_json::json!({"chunk_hash": "abc"}),
            6,
        );

        let mut forged = msg.clone();
        forged.signature[0] ^= 0xFF;
        assert_eq!(forged.id, msg.id, "message id must not depend on the signature");
        assert!(mgr.receive_message(forged).is_err());

        // The forged message must not have marked `msg.id` seen: the
        // legitimate message sharing that id still gets delivered.
        assert!(mgr.receive_message(msg).unwrap());
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hop_count_at_max_is_rejected() {
        let mgr = manager();
        let sender_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let sender_id = NodeId::from_public_key(sender_key.verifying_key().as_bytes());
        let mut msg = GossipMessage::sign_new(
            &sender_key,
            sender_id,
            "chunk_announce",
            serde_json::json!({"chunk_hash": "abc"}),
            1,
        );
        msg.hop_count = 1;
        msg.id = msg.recomputed_id();
        assert!(mgr.receive_message(msg).is_err());
    }

    #[test]
    fn rate_limiter_drops_excess_messages() {
        let mgr = manager();
        let sender_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let sender_id = NodeId::from_public_key(sender_key.verifying_key().as_bytes());
        let mut allowed = 0;
        for i in 0..200 {
            let msg = GossipMessage::sign_new(
                &sender_key,
                sender_id,
                "chunk_announce",
                serde_json::json!({"chunk_hash": format!("h{i}")}),
                6,
            );
            if mgr.receive_message(msg).unwrap_or(false) {
                allowed += 1;
            }
        }
        assert!(allowed < 200, "rate limiter should have throttled some messages");
    }
}
