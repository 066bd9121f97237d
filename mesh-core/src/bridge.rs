//! Shared-memory bridge for zero-copy metrics publication to a host
//! runtime. Consumed and optional: the inline path (plain method calls on
//! a mock) must always work; a real SAB-backed implementation is an
//! opportunistic fast path that is never load-bearing, per the design
//! note grounded on the teacher's `P2PBridge` SAB epoch-signaling pattern.

use crate::error::Result;
use crate::metrics::MeshMetrics;

#[async_trait::async_trait]
pub trait SharedMemoryBridge: Send + Sync {
    async fn write_raw(&self, offset: usize, bytes: &[u8]) -> Result<()>;
    async fn read_raw(&self, offset: usize, size: usize) -> Result<Vec<u8>>;
    async fn signal_epoch(&self, index: u64) -> Result<()>;
    async fn get_address(&self, bytes: usize) -> Option<(usize, bool)>;
}

/// Fixed little-endian metrics frame layout published over the bridge.
pub const METRICS_FRAME_BYTES: usize = 256;

pub fn encode_metrics_frame(metrics: &MeshMetrics) -> [u8; METRICS_FRAME_BYTES] {
    let mut frame = [0u8; METRICS_FRAME_BYTES];
    let mut w = FrameWriter { frame: &mut frame, offset: 0 };
    w.put_u32(metrics.total_peers as u32);
    w.put_u32(metrics.connected_peers as u32);
    w.put_u32(metrics.dht_entries as u32);
    w.put_f32(metrics.gossip_rate);
    w.put_f32(metrics.avg_reputation);
    w.put_u32(metrics.region_id);
    w.put_u64(metrics.bytes_sent);
    w.put_u64(metrics.bytes_received);
    w.put_f32(metrics.p50_latency_ms);
    w.put_f32(metrics.p95_latency_ms);
    w.put_f32(metrics.connection_success_rate);
    w.put_f32(metrics.chunk_fetch_success_rate);
    w.put_u32(metrics.local_chunks as u32);
    w.put_u32(metrics.total_chunks_available as u32);
    frame
}

struct FrameWriter<'a> {
    frame: &'a mut [u8; METRICS_FRAME_BYTES],
    offset: usize,
}

impl<'a> FrameWriter<'a> {
    fn put_u32(&mut self, v: u32) {
        self.frame[self.offset..self.offset + 4].copy_from_slice(&v.to_le_bytes());
        self.offset += 4;
    }

    fn put_u64(&mut self, v: u64) {
        self.frame[self.offset..self.offset + 8].copy_from_slice(&v.to_le_bytes());
        self.offset += 8;
    }

    fn put_f32(&mut self, v: f32) {
        self.frame[self.offset..self.offset + 4].copy_from_slice(&v.to_le_bytes());
        self.offset += 4;
    }
}

/// In-process bridge that just keeps the last written frame in memory;
/// used by `mesh-node`'s default offline mode.
#[derive(Default)]
pub struct MockBridge {
    memory: parking_lot::Mutex<Vec<u8>>,
}

impl MockBridge {
    pub fn new(size: usize) -> Self {
        Self {
            memory: parking_lot::Mutex::new(vec![0u8; size]),
        }
    }
}

#[async_trait::async_trait]
impl SharedMemoryBridge for MockBridge {
    async fn write_raw(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut mem = self.memory.lock();
        if offset + bytes.len() > mem.len() {
            mem.resize(offset + bytes.len(), 0);
        }
        mem[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    async fn read_raw(&self, offset: usize, size: usize) -> Result<Vec<u8>> {
        let mem = self.memory.lock();
        Ok(mem.get(offset..offset + size).map(|s| s.to_vec()).unwrap_or_default())
    }

    async fn signal_epoch(&self, _index: u64) -> Result<()> {
        Ok(())
    }

    async fn get_address(&self, _bytes: usize) -> Option<(usize, bool)> {
        Some((0, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_has_fixed_size() {
        let metrics = MeshMetrics::default();
        let frame = encode_metrics_frame(&metrics);
        assert_eq!(frame.len(), METRICS_FRAME_BYTES);
    }

    #[tokio::test]
    async fn mock_bridge_round_trips_raw_bytes() {
        let bridge = MockBridge::new(64);
        bridge.write_raw(8, b"hello").await.unwrap();
        let read = bridge.read_raw(8, 5).await.unwrap();
        assert_eq!(read, b"hello");
    }
}
