use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Node identifier: a 160-bit key space, raw bytes interpreted big-endian
/// for XOR distance, matching the routing table's bucket indexing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn from_public_key(bytes: &[u8]) -> Self {
        let digest = blake3::hash(bytes);
        let mut id = [0u8; 20];
        id.copy_from_slice(&digest.as_bytes()[..20]);
        Self(id)
    }

    pub fn random() -> Self {
        let mut buf = [0u8; 20];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut buf);
        Self(buf)
    }

    pub fn xor_distance(&self, other: &NodeId) -> [u8; 20] {
        let mut out = [0u8; 20];
        for i in 0..20 {
            out[i] = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Bucket index = 160 - bitlen(XOR), per the routing table's design
    /// note. Identical ids (bitlen 0) fall in the last bucket, 159.
    pub fn bucket_index(&self, other: &NodeId) -> usize {
        let distance = self.xor_distance(other);
        let total_bits = distance.len() * 8;
        for (byte_idx, byte) in distance.iter().enumerate() {
            if *byte != 0 {
                let leading = byte.leading_zeros() as usize;
                let bitlen = total_bits - (byte_idx * 8 + leading);
                return total_bits - bitlen;
            }
        }
        total_bits - 1
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Content hash identifying a chunk, independent of which peers hold it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkHash(pub [u8; 32]);

impl ChunkHash {
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Decentralized identifier for an economic actor (requester, provider,
/// referrer). Distinct from `NodeId`: a DID may span multiple nodes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Did(pub String);

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Did({})", self.0)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Known-good description of a mesh peer, as tracked by the routing table
/// and the peer selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub address: String,
    pub last_seen_ms: u64,
    pub region: Option<String>,
    pub bandwidth_kbps: u32,
    pub latency_ms: u32,
    pub gpu_available: bool,
}

impl PeerInfo {
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
            last_seen_ms: now_ms(),
            region: None,
            bandwidth_kbps: 1_000,
            latency_ms: 100,
            gpu_available: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen_ms = now_ms();
    }
}

/// Content replication tier, mirroring the spec's cost/replica schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationTier {
    Hot,
    Warm,
    Cold,
    Archive,
}

impl ReplicationTier {
    pub fn access_cost(&self) -> u64 {
        match self {
            ReplicationTier::Hot => 1,
            ReplicationTier::Warm => 5,
            ReplicationTier::Cold => 20,
            ReplicationTier::Archive => 100,
        }
    }

    pub fn base_replica_count(&self) -> u32 {
        match self {
            ReplicationTier::Hot => 10,
            ReplicationTier::Warm => 5,
            ReplicationTier::Cold => 2,
            ReplicationTier::Archive => 1,
        }
    }

    pub fn promote(&self) -> ReplicationTier {
        match self {
            ReplicationTier::Archive => ReplicationTier::Cold,
            ReplicationTier::Cold => ReplicationTier::Warm,
            ReplicationTier::Warm | ReplicationTier::Hot => ReplicationTier::Hot,
        }
    }

    pub fn demote(&self) -> ReplicationTier {
        match self {
            ReplicationTier::Hot => ReplicationTier::Warm,
            ReplicationTier::Warm => ReplicationTier::Cold,
            ReplicationTier::Cold | ReplicationTier::Archive => ReplicationTier::Archive,
        }
    }
}

/// A fixed-size content chunk as stored and exchanged across the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub hash: ChunkHash,
    pub data: bytes::Bytes,
}

impl Chunk {
    pub fn new(data: Vec<u8>) -> Self {
        let hash = ChunkHash::of(&data);
        Self {
            hash,
            data: bytes::Bytes::from(data),
        }
    }

    pub fn is_valid(&self) -> bool {
        ChunkHash::of(&self.data) == self.hash
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_distance_is_zero_for_self() {
        let id = NodeId::random();
        assert_eq!(id.xor_distance(&id), [0u8; 20]);
        // Identical ids have zero-length XOR, falling in the last bucket.
        assert_eq!(id.bucket_index(&id), 159);
    }

    #[test]
    fn closer_peer_has_higher_or_equal_bucket_index() {
        // Invariant 1: distance(self,a) < distance(self,b) implies
        // bucket(a) >= bucket(b).
        let local = NodeId([0u8; 20]);
        let mut a = [0u8; 20];
        a[19] = 0x01; // minimal distance
        let mut b = [0u8; 20];
        b[0] = 0x80; // maximal distance
        let a = NodeId(a);
        let b = NodeId(b);
        assert!(local.xor_distance(&a) < local.xor_distance(&b));
        assert!(local.bucket_index(&a) >= local.bucket_index(&b));
    }

    #[test]
    fn chunk_hash_is_content_addressed() {
        let a = Chunk::new(b"hello".to_vec());
        let b = Chunk::new(b"hello".to_vec());
        assert_eq!(a.hash, b.hash);
        assert!(a.is_valid());
    }

    #[test]
    fn tampered_chunk_fails_validation() {
        let mut chunk = Chunk::new(b"hello".to_vec());
        chunk.data = bytes::Bytes::from_static(b"tampered");
        assert!(!chunk.is_valid());
    }

    #[test]
    fn replication_tier_promotes_and_demotes() {
        assert_eq!(ReplicationTier::Archive.promote(), ReplicationTier::Cold);
        assert_eq!(ReplicationTier::Hot.demote(), ReplicationTier::Warm);
        assert_eq!(ReplicationTier::Hot.access_cost(), 1);
        assert_eq!(ReplicationTier::Archive.access_cost(), 100);
    }
}
