//! Orchestrator binding every subsystem together: chunk distribution and
//! retrieval, compute delegation with escrowed settlement, and the
//! background loops that keep metrics, health, caches, and the economic
//! epoch moving. Grounded on the teacher's async retry/backoff shape in
//! `distributed.rs::load_single_chunk_with_retry` and its cooperative
//! shutdown over a notify handle.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::allocator::{AdaptiveAllocator, ResourceDescriptor};
use crate::bridge::{encode_metrics_frame, SharedMemoryBridge};
use crate::cache::{ChunkCache, DemandTracker};
use crate::config::MeshConfig;
use crate::delegation::{DelegationEngine, DigestValidator};
use crate::dispatcher::SharedDispatcher;
use crate::error::{MeshError, Result};
use crate::gossip::GossipManager;
use crate::ledger::{Ledger, ShardContribution};
use crate::metrics::{self, MeshMetrics};
use crate::reputation::{CircuitBreakerRegistry, ReputationTracker};
use crate::routing::{iterative_find_node, DhtStore, LookupQuerier, RoutingTable};
use crate::selector::PeerSelector;
use crate::storage::SharedStorage;
use crate::transport::SharedTransport;
use crate::types::{now_ms, Chunk, ChunkHash, Did, NodeId, PeerInfo};

/// Serialized record the wire actually exchanges for a delegated payload:
/// either inline bytes or a zero-copy shared-memory reference, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    pub id: String,
    pub digest: String,
    pub raw_size: usize,
    pub compression: String,
    pub inline: Option<Vec<u8>>,
}

fn make_envelope(id: impl Into<String>, data: &[u8], compression_threshold: usize) -> ResourceEnvelope {
    let digest = blake3::hash(data).to_hex().to_string();
    let raw_size = data.len();
    if raw_size > compression_threshold {
        if let Some(compressed) = compress_brotli(data) {
            if compressed.len() < raw_size {
                return ResourceEnvelope {
                    id: id.into(),
                    digest,
                    raw_size,
                    compression: "brotli".to_string(),
                    inline: Some(compressed),
                };
            }
        }
    }
    ResourceEnvelope {
        id: id.into(),
        digest,
        raw_size,
        compression: "none".to_string(),
        inline: Some(data.to_vec()),
    }
}

fn decode_envelope(envelope: &ResourceEnvelope) -> Result<Vec<u8>> {
    let Some(inline) = &envelope.inline else {
        return Err(MeshError::ChunkNotFound {
            chunk_hash: envelope.id.clone(),
            context: Default::default(),
        });
    };
    let raw = match envelope.compression.as_str() {
        "brotli" => decompress_brotli(inline)?,
        _ => inline.clone(),
    };
    let digest = blake3::hash(&raw).to_hex().to_string();
    if digest != envelope.digest {
        return Err(MeshError::DigestMismatch {
            expected: envelope.digest.clone(),
            actual: digest,
            context: Default::default(),
        });
    }
    Ok(raw)
}

fn compress_brotli(data: &[u8]) -> Option<Vec<u8>> {
    use std::io::Write;
    let mut out = Vec::new();
    {
        let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
        writer.write_all(data).ok()?;
    }
    Some(out)
}

fn decompress_brotli(data: &[u8]) -> Result<Vec<u8>> {
    use std::io::Read;
    let mut out = Vec::new();
    brotli::Decompressor::new(data, 4096)
        .read_to_end(&mut out)
        .map_err(|e| MeshError::Serialization {
            message: e.to_string(),
            context: Default::default(),
        })?;
    Ok(out)
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkStoreRequest {
    chunk_hash: String,
    data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkStoreResponse {
    stored: bool,
    size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkFetchRequest {
    chunk_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkFetchResponse {
    data: Vec<u8>,
    size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct DelegateComputeRequest {
    id: String,
    operation: String,
    resource: ResourceEnvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelegateStatus {
    Success,
    Failed,
    InputMissing,
}

#[derive(Debug, Serialize, Deserialize)]
struct DelegateComputeResponse {
    status: DelegateStatus,
    resource: Option<ResourceEnvelope>,
    latency_ms: u64,
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DelegateOutcome {
    pub success: bool,
    pub data: Option<Vec<u8>>,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Target node count for a delegated operation, by payload size.
fn node_count_for_size(bytes: u64) -> usize {
    const MB: u64 = 1 << 20;
    if bytes < 10 * MB {
        1
    } else if bytes < 100 * MB {
        5
    } else if bytes < 1024 * MB {
        20
    } else {
        50
    }
}

struct TransportQuerier(SharedTransport);

#[async_trait::async_trait]
impl LookupQuerier for TransportQuerier {
    async fn find_node(&self, peer: &PeerInfo, target: &NodeId) -> Result<Vec<PeerInfo>> {
        self.0.find_node(&peer.node_id, target).await
    }
}

fn node_id_from_chunk_hash(hash: &ChunkHash) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&hash.0[..20]);
    NodeId(bytes)
}

/// A peer's derived DID, used only where the ledger needs an economic
/// identity for a transport-level `NodeId`. No separate identity registry
/// exists yet, so a peer's DID is its node id's hex encoding.
fn peer_did(node_id: NodeId) -> Did {
    Did(format!("did:mesh:{}", node_id.to_hex()))
}

pub struct Coordinator {
    local_id: NodeId,
    local_region: Option<String>,
    config: MeshConfig,
    routing: Arc<RoutingTable>,
    dht_store: Arc<DhtStore>,
    gossip: Arc<GossipManager>,
    cache: Arc<ChunkCache>,
    demand: Arc<DemandTracker>,
    allocator: AdaptiveAllocator,
    selector: PeerSelector,
    reputation: Arc<ReputationTracker>,
    breakers: Arc<CircuitBreakerRegistry>,
    ledger: Arc<Ledger>,
    delegation: Arc<DelegationEngine>,
    transport: SharedTransport,
    storage: SharedStorage,
    dispatcher: SharedDispatcher,
    bridge: Option<Arc<dyn SharedMemoryBridge>>,
    querier: TransportQuerier,
    shutdown: Notify,
    shutting_down: AtomicBool,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
    epoch: AtomicU64,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: NodeId,
        local_region: Option<String>,
        config: MeshConfig,
        routing: Arc<RoutingTable>,
        dht_store: Arc<DhtStore>,
        gossip: Arc<GossipManager>,
        cache: Arc<ChunkCache>,
        demand: Arc<DemandTracker>,
        reputation: Arc<ReputationTracker>,
        breakers: Arc<CircuitBreakerRegistry>,
        ledger: Arc<Ledger>,
        delegation: Arc<DelegationEngine>,
        transport: SharedTransport,
        storage: SharedStorage,
        dispatcher: SharedDispatcher,
        bridge: Option<Arc<dyn SharedMemoryBridge>>,
    ) -> Self {
        let allocator = AdaptiveAllocator::new(config.replication.clone());
        let selector = PeerSelector::new(crate::selector::SelectorConfig::default());
        let querier = TransportQuerier(transport.clone());
        Self {
            local_id,
            local_region,
            config,
            routing,
            dht_store,
            gossip,
            cache,
            demand,
            allocator,
            selector,
            reputation,
            breakers,
            ledger,
            delegation,
            transport,
            storage,
            dispatcher,
            bridge,
            querier,
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
            loop_handles: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
        }
    }

    fn select_best(&self, peers: &[PeerInfo]) -> Option<PeerInfo> {
        let now = now_ms();
        self.selector
            .select_best(
                peers,
                |p| self.reputation.trust_score(p.node_id).0,
                self.local_region.as_deref(),
                now,
            )
            .cloned()
    }

    async fn resolve_peer_infos(&self, ids: &[NodeId]) -> Vec<PeerInfo> {
        let mut peers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(p) = self.transport.get_peer_capabilities(id).await {
                peers.push(p);
            }
        }
        peers
    }

    /// Allocates replicas by demand and size, finds candidate providers via
    /// the DHT, sends the chunk to the top-scoring `N`, and registers it
    /// locally. Local storage counts as one of the delivered replicas.
    pub async fn distribute_chunk(&self, data: Vec<u8>) -> Result<usize> {
        let chunk = Chunk::new(data);
        let demand_score = self.demand.demand_score(&chunk.hash);
        let replicas = self.allocator.calculate_replicas(ResourceDescriptor {
            size_bytes: chunk.data.len() as u64,
            demand: demand_score,
            budget: 1.0,
        });

        let target = node_id_from_chunk_hash(&chunk.hash);
        let candidates = match iterative_find_node(&self.routing, &self.querier, &target).await {
            Ok(peers) => peers,
            Err(_) => self.routing.closest_peers(&target, replicas as usize * 2),
        };

        let now = now_ms();
        let mut scored: Vec<(PeerInfo, f32)> = candidates
            .into_iter()
            .filter(|p| !self.breakers.is_open(p.node_id))
            .map(|p| {
                let (rep, _) = self.reputation.trust_score(p.node_id);
                let score = self.selector.score(&p, rep, self.local_region.as_deref(), now);
                (p, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(CmpOrdering::Equal));
        scored.truncate(replicas as usize);

        let sends = scored.iter().map(|(peer, _)| self.send_chunk_to_peer(peer.node_id, &chunk));
        let results = futures::future::join_all(sends).await;
        let mut delivered = results.into_iter().filter(|ok| *ok).count();

        self.storage.store_chunk(&chunk.hash, chunk.data.clone()).await?;
        delivered += 1;

        self.dht_store
            .store(chunk.hash, self.local_id, self.config.coordinator.chunk_provider_ttl_secs);
        self.gossip.announce_chunk(&chunk.hash.to_hex())?;
        self.cache
            .put(chunk.hash, scored.iter().map(|(p, _)| p.node_id).collect());

        Ok(delivered)
    }

    async fn send_chunk_to_peer(&self, peer: NodeId, chunk: &Chunk) -> bool {
        let request = ChunkStoreRequest {
            chunk_hash: chunk.hash.to_hex(),
            data: chunk.data.to_vec(),
        };
        let Ok(args) = bincode::serialize(&request) else {
            return false;
        };
        match self.transport.send_rpc(&peer, "chunk.store", args, Duration::from_secs(10)).await {
            Ok(reply) => bincode::deserialize::<ChunkStoreResponse>(&reply)
                .map(|r| r.stored)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Local storage first; otherwise retries `FindBestPeerForChunk` +
    /// `chunk.fetch` with exponential backoff, recording reputation and
    /// breaker outcomes on each attempt.
    pub async fn fetch_chunk(&self, hash: &ChunkHash) -> Result<bytes::Bytes> {
        if self.storage.has_chunk(hash).await {
            return self.storage.fetch_chunk(hash).await;
        }
        self.demand.record_access(*hash);

        let mut last_err = None;
        for attempt in 0..self.config.coordinator.max_fetch_retries {
            match self.find_best_peer_for_chunk(hash).await {
                Ok(peer) => {
                    let start = now_ms();
                    match self.fetch_chunk_from_peer(peer.node_id, hash).await {
                        Ok(data) => {
                            let latency = now_ms().saturating_sub(start) as u32;
                            self.reputation.record(peer.node_id, true, latency);
                            self.breakers.record(peer.node_id, true);
                            return Ok(data);
                        }
                        Err(e) => {
                            self.reputation.record(peer.node_id, false, 0);
                            self.breakers.record(peer.node_id, false);
                            last_err = Some(e);
                        }
                    }
                }
                Err(e) => last_err = Some(e),
            }
            let backoff = self.config.coordinator.fetch_backoff_base_ms * (1u64 << attempt);
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
        Err(last_err.unwrap_or_else(|| MeshError::ChunkNotFound {
            chunk_hash: hash.to_hex(),
            context: Default::default(),
        }))
    }

    async fn fetch_chunk_from_peer(&self, peer: NodeId, hash: &ChunkHash) -> Result<bytes::Bytes> {
        let request = ChunkFetchRequest { chunk_hash: hash.to_hex() };
        let args = bincode::serialize(&request).map_err(|e| MeshError::Serialization {
            message: e.to_string(),
            context: Default::default(),
        })?;
        let reply = self.transport.send_rpc(&peer, "chunk.fetch", args, Duration::from_secs(10)).await?;
        let response: ChunkFetchResponse = bincode::deserialize(&reply).map_err(|e| MeshError::Serialization {
            message: e.to_string(),
            context: Default::default(),
        })?;
        Ok(bytes::Bytes::from(response.data))
    }

    /// Cache hit goes straight to the selector; otherwise consults the DHT
    /// value store, fetches capabilities under a bounded semaphore, and
    /// caches the resolved peer set for next time.
    pub async fn find_best_peer_for_chunk(&self, hash: &ChunkHash) -> Result<PeerInfo> {
        if let Some(mapping) = self.cache.get(hash) {
            let peers = self.resolve_peer_infos(&mapping.peer_ids).await;
            let peers: Vec<PeerInfo> = peers.into_iter().filter(|p| !self.breakers.is_open(p.node_id)).collect();
            if let Some(best) = self.select_best(&peers) {
                return Ok(best);
            }
        }

        let provider_ids = self.dht_store.find_peers(hash);
        if provider_ids.is_empty() {
            return Err(MeshError::ChunkNotFound {
                chunk_hash: hash.to_hex(),
                context: Default::default(),
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.config.coordinator.capability_fetch_concurrency));
        let mut tasks = Vec::with_capacity(provider_ids.len());
        for id in provider_ids {
            let sem = semaphore.clone();
            let transport = self.transport.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                transport.get_peer_capabilities(&id).await.ok()
            }));
        }
        let mut peers = Vec::new();
        for task in tasks {
            if let Ok(Some(p)) = task.await {
                peers.push(p);
            }
        }
        let peers: Vec<PeerInfo> = peers.into_iter().filter(|p| !self.breakers.is_open(p.node_id)).collect();
        self.cache.put(*hash, peers.iter().map(|p| p.node_id).collect());

        self.select_best(&peers).ok_or_else(|| MeshError::InsufficientPeers {
            required: 1,
            available: 0,
            context: Default::default(),
        })
    }

    fn candidate_peers(&self, count: usize) -> Vec<PeerInfo> {
        self.routing
            .closest_peers(&NodeId::random(), count)
            .into_iter()
            .filter(|p| !self.breakers.is_open(p.node_id))
            .collect()
    }

    /// Single-peer path for payloads under the size threshold; otherwise
    /// shards and dispatches in parallel, settling via a shared escrow.
    pub async fn delegate_compute(
        &self,
        operation: &str,
        requester: Did,
        data: Vec<u8>,
        priority: u32,
    ) -> Result<DelegateOutcome> {
        let size = data.len() as u64;
        let avg_latency = self.average_peer_latency_ms();
        let efficiency = self.delegation.compute_efficiency(size, avg_latency, priority);
        if !self.delegation.should_delegate(efficiency) {
            return self.execute_locally(operation, data).await;
        }

        let node_count = node_count_for_size(size);
        let job_id = format!("job-{}-{}", operation, uuid_like());
        let cost = crate::ledger::DelegationPricing::calculate_delegation_cost(operation, size, priority);

        if node_count <= 1 {
            self.delegate_single(operation, requester, data, job_id, cost).await
        } else {
            self.delegate_parallel(operation, requester, data, job_id, cost, node_count).await
        }
    }

    fn average_peer_latency_ms(&self) -> u32 {
        let peers = self.candidate_peers(10);
        if peers.is_empty() {
            return 100;
        }
        (peers.iter().map(|p| p.latency_ms as u64).sum::<u64>() / peers.len() as u64) as u32
    }

    /// Runs the operation on this node's own dispatcher, with no mesh hop
    /// and no escrow — used when the delegation engine judges the mesh
    /// detour not worth its transfer/compute cost.
    async fn execute_locally(&self, operation: &str, data: Vec<u8>) -> Result<DelegateOutcome> {
        let start = now_ms();
        let job = crate::dispatcher::Job {
            id: uuid_like(),
            operation: operation.to_string(),
            data,
            priority: 0,
        };
        let result = self.dispatcher.execute_job(job).await?;
        Ok(DelegateOutcome {
            success: result.success,
            data: Some(result.data),
            latency_ms: now_ms().saturating_sub(start),
            error: result.error,
        })
    }

    async fn delegate_single(
        &self,
        operation: &str,
        requester: Did,
        data: Vec<u8>,
        job_id: String,
        cost: i64,
    ) -> Result<DelegateOutcome> {
        let candidates = self.candidate_peers(20);
        if candidates.is_empty() {
            return Err(MeshError::InsufficientPeers {
                required: 1,
                available: 0,
                context: Default::default(),
            });
        }

        let peer = candidates
            .iter()
            .map(|p| {
                let (rep, _) = self.reputation.trust_score(p.node_id);
                let latency_secs = p.latency_ms as f32 / 1000.0;
                let mut score = rep / (latency_secs + 0.1);
                if self.local_region.as_deref() == p.region.as_deref() && p.region.is_some() {
                    score *= 1.5;
                }
                (p, score)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(CmpOrdering::Equal))
            .map(|(p, _)| p.clone())
            .expect("candidates is non-empty");

        let escrow_id = format!("{job_id}-escrow");
        self.ledger.create_escrow(
            escrow_id.clone(),
            requester.clone(),
            cost,
            self.config.ledger.escrow_default_expiry_ms,
            job_id.clone(),
        )?;
        let provider_did = peer_did(peer.node_id);
        self.ledger.assign_provider(&escrow_id, provider_did)?;

        let envelope = make_envelope(job_id.clone(), &data, self.config.coordinator.compression_threshold_bytes);
        let request = DelegateComputeRequest {
            id: job_id.clone(),
            operation: operation.to_string(),
            resource: envelope,
        };
        let args = bincode::serialize(&request).map_err(|e| MeshError::Serialization {
            message: e.to_string(),
            context: Default::default(),
        })?;

        let start = now_ms();
        let rpc_result = self
            .transport
            .send_rpc(&peer.node_id, "mesh.DelegateCompute", args, Duration::from_secs(30))
            .await;
        let latency_ms = now_ms().saturating_sub(start);

        let outcome = match rpc_result {
            Ok(reply) => self.finalize_single_delegation(&escrow_id, peer.node_id, &reply, latency_ms),
            Err(e) => {
                self.reputation.record(peer.node_id, false, 0);
                self.breakers.record(peer.node_id, false);
                self.ledger.refund_to_requester(&escrow_id)?;
                Ok(DelegateOutcome {
                    success: false,
                    data: None,
                    latency_ms,
                    error: Some(e.to_string()),
                })
            }
        };
        outcome
    }

    fn finalize_single_delegation(
        &self,
        escrow_id: &str,
        peer: NodeId,
        reply: &[u8],
        latency_ms: u64,
    ) -> Result<DelegateOutcome> {
        let response: DelegateComputeResponse = match bincode::deserialize(reply) {
            Ok(r) => r,
            Err(e) => {
                self.ledger.refund_to_requester(escrow_id)?;
                return Ok(DelegateOutcome {
                    success: false,
                    data: None,
                    latency_ms,
                    error: Some(e.to_string()),
                });
            }
        };

        if response.status != DelegateStatus::Success {
            self.reputation.record(peer, false, latency_ms as u32);
            self.breakers.record(peer, false);
            self.ledger.refund_to_requester(escrow_id)?;
            return Ok(DelegateOutcome {
                success: false,
                data: None,
                latency_ms,
                error: response.error,
            });
        }

        let Some(envelope) = &response.resource else {
            self.ledger.refund_to_requester(escrow_id)?;
            return Ok(DelegateOutcome {
                success: false,
                data: None,
                latency_ms,
                error: Some("success status without a resource".to_string()),
            });
        };

        match decode_envelope(envelope) {
            Ok(decoded) => {
                self.reputation.record(peer, true, latency_ms as u32);
                self.breakers.record(peer, true);
                self.ledger.release_to_provider(escrow_id, true, None, None, None)?;
                Ok(DelegateOutcome {
                    success: true,
                    data: Some(decoded),
                    latency_ms,
                    error: None,
                })
            }
            Err(e) => {
                self.reputation.record(peer, false, latency_ms as u32);
                self.breakers.record(peer, false);
                self.ledger.refund_to_requester(escrow_id)?;
                Ok(DelegateOutcome {
                    success: false,
                    data: None,
                    latency_ms,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    async fn delegate_parallel(
        &self,
        operation: &str,
        requester: Did,
        data: Vec<u8>,
        job_id: String,
        cost: i64,
        node_count: usize,
    ) -> Result<DelegateOutcome> {
        let candidates = self.candidate_peers(node_count * 3);
        if candidates.is_empty() {
            return Err(MeshError::InsufficientPeers {
                required: node_count,
                available: 0,
                context: Default::default(),
            });
        }

        let now = now_ms();
        let mut scored: Vec<(PeerInfo, f32)> = candidates
            .into_iter()
            .map(|p| {
                let (rep, _) = self.reputation.trust_score(p.node_id);
                let score = self.selector.score(&p, rep, self.local_region.as_deref(), now);
                (p, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(CmpOrdering::Equal));
        let shard_count = node_count.min(scored.len());
        let peers: Vec<PeerInfo> = scored.into_iter().take(shard_count).map(|(p, _)| p).collect();

        let shards = split_shards(&data, shard_count);

        self.ledger.create_shared_escrow(job_id.clone(), requester, cost, shard_count)?;

        let timeout = Duration::from_millis(self.config.coordinator.parallel_shard_timeout_ms);
        let compression_threshold = self.config.coordinator.compression_threshold_bytes;
        let mut tasks = Vec::with_capacity(shard_count);
        for (idx, (peer, shard)) in peers.iter().zip(shards.iter()).enumerate() {
            let peer_id = peer.node_id;
            let transport = self.transport.clone();
            let operation = operation.to_string();
            let shard = shard.clone();
            let shard_job_id = format!("{job_id}-shard-{idx}");
            tasks.push(tokio::spawn(async move {
                let envelope = make_envelope(shard_job_id.clone(), &shard, compression_threshold);
                let request = DelegateComputeRequest {
                    id: shard_job_id,
                    operation,
                    resource: envelope,
                };
                let args = bincode::serialize(&request).ok()?;
                let start = now_ms();
                let reply = tokio::time::timeout(timeout, transport.send_rpc(&peer_id, "mesh.DelegateCompute", args, timeout))
                    .await
                    .ok()?
                    .ok()?;
                let latency_ms = now_ms().saturating_sub(start);
                let response: DelegateComputeResponse = bincode::deserialize(&reply).ok()?;
                Some((idx, peer_id, shard.len(), latency_ms, response))
            }));
        }

        let mut shard_results = Vec::with_capacity(shard_count);
        for task in tasks {
            shard_results.push(task.await.ok().flatten());
        }

        let mut ordered: Vec<Option<Vec<u8>>> = vec![None; shard_count];
        let mut any_verified = false;

        for result in shard_results {
            let Some((idx, peer_id, shard_size, latency_ms, response)) = result else {
                continue;
            };
            let verified = response.status == DelegateStatus::Success
                && response
                    .resource
                    .as_ref()
                    .map(|r| decode_envelope(r).is_ok())
                    .unwrap_or(false);

            self.reputation.record(peer_id, verified, latency_ms as u32);
            self.breakers.record(peer_id, verified);

            if verified {
                any_verified = true;
                if let Some(envelope) = &response.resource {
                    if let Ok(decoded) = decode_envelope(envelope) {
                        ordered[idx] = Some(decoded);
                    }
                }
            }

            self.ledger.record_shard_contribution(
                &job_id,
                ShardContribution {
                    peer_id,
                    shard_index: idx,
                    shard_size: shard_size as u64,
                    verified,
                    latency_ms: latency_ms as u32,
                    completed_at_ms: now_ms(),
                },
            )?;
        }

        let mut worker_dids = std::collections::HashMap::new();
        for peer in &peers {
            worker_dids.insert(peer.node_id, peer_did(peer.node_id));
        }
        self.ledger.settle_shared_escrow(&job_id, &worker_dids)?;

        if !any_verified {
            return Ok(DelegateOutcome {
                success: false,
                data: None,
                latency_ms: 0,
                error: Some("zero shards verified".to_string()),
            });
        }

        let aggregated: Vec<u8> = ordered.into_iter().flatten().flatten().collect();
        Ok(DelegateOutcome {
            success: true,
            data: Some(aggregated),
            latency_ms: 0,
            error: None,
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut handles = self.loop_handles.lock();
        handles.push(tokio::spawn(Self::metrics_loop(self.clone())));
        handles.push(tokio::spawn(Self::health_loop(self.clone())));
        handles.push(tokio::spawn(Self::cache_cleanup_loop(self.clone())));
        handles.push(tokio::spawn(Self::epoch_loop(self.clone())));
    }

    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        let handles: Vec<JoinHandle<()>> = self.loop_handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn metrics_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.coordinator.metrics_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => self.publish_metrics().await,
                _ = self.shutdown.notified() => break,
            }
        }
    }

    async fn health_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.coordinator.health_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let health = self.gossip.health();
                    tracing::debug!(peer_count = health.peer_count, healthy = health.healthy, "gossip health check");
                }
                _ = self.shutdown.notified() => break,
            }
        }
    }

    async fn cache_cleanup_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.coordinator.cache_cleanup_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.cache.cleanup_expired();
                    self.gossip.cleanup_expired();
                    self.dht_store.cleanup_expired();
                    self.demand.decay_all();
                    let expired = self.ledger.expire_stale_escrows();
                    if !expired.is_empty() {
                        tracing::info!(count = expired.len(), "expired stale escrows");
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }
    }

    async fn epoch_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.coordinator.epoch_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.epoch.fetch_add(1, Ordering::Relaxed);
                    let _ = self.gossip.push_round().await;
                    let _ = self.gossip.pull_round().await;
                }
                _ = self.shutdown.notified() => break,
            }
        }
    }

    async fn publish_metrics(&self) {
        let connection_metrics = self.transport.get_connection_metrics().await;
        let transport_stats = self.transport.get_stats().await;
        let gossip_health = self.gossip.health();
        let snapshot = MeshMetrics {
            total_peers: self.routing.len(),
            connected_peers: connection_metrics.connected_peers,
            dht_entries: self.dht_store.entry_count(),
            gossip_rate: gossip_health.send_recv_rate,
            avg_reputation: self.reputation.average_score(),
            region_id: self.local_region.as_deref().map(metrics::region_id).unwrap_or(0),
            bytes_sent: connection_metrics.bytes_sent,
            bytes_received: connection_metrics.bytes_received,
            p50_latency_ms: 0.0,
            p95_latency_ms: 0.0,
            connection_success_rate: connection_metrics.connection_success_rate,
            chunk_fetch_success_rate: 0.0,
            local_chunks: self.storage.chunk_count().await,
            total_chunks_available: self.dht_store.entry_count(),
        };
        tracing::info!(
            peers = snapshot.total_peers,
            rpc_calls = transport_stats.rpc_calls,
            "metrics tick"
        );

        if let Some(bridge) = &self.bridge {
            let frame = encode_metrics_frame(&snapshot);
            if let Err(e) = bridge.write_raw(0, &frame).await {
                tracing::warn!(error = %e, "failed to publish metrics frame to bridge");
            }
            let epoch = self.epoch.load(Ordering::Relaxed);
            if let Err(e) = bridge.signal_epoch(epoch).await {
                tracing::warn!(error = %e, "failed to signal bridge epoch");
            }
        }
    }
}

fn split_shards(data: &[u8], count: usize) -> Vec<Vec<u8>> {
    let count = count.max(1);
    let base = data.len() / count;
    let mut shards = Vec::with_capacity(count);
    let mut offset = 0;
    for i in 0..count {
        let end = if i == count - 1 { data.len() } else { offset + base };
        shards.push(data[offset..end].to_vec());
        offset = end;
    }
    shards
}

fn uuid_like() -> String {
    let random = NodeId::random();
    random.to_hex()[..16].to_string()
}
