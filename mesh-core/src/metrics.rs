//! Aggregate metrics snapshot published periodically by the coordinator,
//! both to logs (via `tracing`) and, when attached, the shared-memory
//! bridge's fixed frame.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshMetrics {
    pub total_peers: usize,
    pub connected_peers: usize,
    pub dht_entries: usize,
    pub gossip_rate: f32,
    pub avg_reputation: f32,
    pub region_id: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub p50_latency_ms: f32,
    pub p95_latency_ms: f32,
    pub connection_success_rate: f32,
    pub chunk_fetch_success_rate: f32,
    pub local_chunks: usize,
    pub total_chunks_available: usize,
}

/// CRC32 of a region string, used as the compact `region_id` field in the
/// metrics frame.
pub fn region_id(region: &str) -> u32 {
    crc32(region.as_bytes())
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_id_is_stable() {
        assert_eq!(region_id("us-east"), region_id("us-east"));
        assert_ne!(region_id("us-east"), region_id("eu-west"));
    }
}
