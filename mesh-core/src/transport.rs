//! Abstract transport the coordinator consumes. Every method here is a
//! contract fulfilled by a host-provided implementation (WebRTC/WebSocket in
//! production); this crate ships only an in-memory mock for tests, grounded
//! on the teacher's `ChunkLoader`/`StorageChunkLoader` trait-plus-default-impl
//! pattern.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{MeshError, Result};
use crate::types::{NodeId, PeerInfo};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connected_peers: usize,
    pub connection_success_rate: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub rpc_calls: u64,
}

/// An RPC call as seen by the transport layer: method name plus
/// pre-serialized argument and reply bytes, so the transport never needs to
/// understand application-level schemas.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn connect(&self, peer: &PeerInfo) -> Result<()>;
    async fn disconnect(&self, peer: &NodeId) -> Result<()>;
    async fn is_connected(&self, peer: &NodeId) -> bool;

    async fn send_rpc(
        &self,
        peer: &NodeId,
        method: &str,
        args: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>>;

    async fn send_message(&self, peer: &NodeId, payload: Vec<u8>) -> Result<()>;
    async fn broadcast(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    async fn get_peer_capabilities(&self, peer: &NodeId) -> Result<PeerInfo>;
    async fn ping(&self, peer: &NodeId, timeout: Duration) -> Result<Duration>;

    async fn find_node(&self, peer: &NodeId, target: &NodeId) -> Result<Vec<PeerInfo>>;
    async fn find_value(&self, peer: &NodeId, key: &str) -> Result<Option<Vec<u8>>>;
    async fn store(&self, peer: &NodeId, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn get_connection_metrics(&self) -> ConnectionMetrics;
    async fn get_stats(&self) -> TransportStats;
}

/// In-memory transport used by `mesh-node`'s offline mode and by
/// `mesh-core`'s own tests. Peers are simulated as entries in a shared
/// registry rather than real sockets.
#[derive(Default)]
pub struct MockTransport {
    connected: Mutex<HashMap<NodeId, PeerInfo>>,
    stats: Mutex<TransportStats>,
    peers: Mutex<HashMap<NodeId, PeerInfo>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_peer(&self, peer: PeerInfo) {
        self.peers.lock().await.insert(peer.node_id, peer);
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<()> {
        self.connected.lock().await.insert(peer.node_id, peer.clone());
        Ok(())
    }

    async fn disconnect(&self, peer: &NodeId) -> Result<()> {
        self.connected.lock().await.remove(peer);
        Ok(())
    }

    async fn is_connected(&self, peer: &NodeId) -> bool {
        self.connected.lock().await.contains_key(peer)
    }

    async fn send_rpc(
        &self,
        peer: &NodeId,
        _method: &str,
        _args: Vec<u8>,
        _timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.stats.lock().await.rpc_calls += 1;
        Err(MeshError::PeerUnreachable {
            peer_id: peer.to_string(),
            context: Default::default(),
        })
    }

    async fn send_message(&self, _peer: &NodeId, _payload: Vec<u8>) -> Result<()> {
        self.stats.lock().await.messages_sent += 1;
        Ok(())
    }

    async fn broadcast(&self, _topic: &str, _payload: Vec<u8>) -> Result<()> {
        self.stats.lock().await.messages_sent += 1;
        Ok(())
    }

    async fn get_peer_capabilities(&self, peer: &NodeId) -> Result<PeerInfo> {
        self.peers
            .lock()
            .await
            .get(peer)
            .cloned()
            .ok_or_else(|| MeshError::PeerNotFound {
                peer_id: peer.to_string(),
                context: Default::default(),
            })
    }

    async fn ping(&self, peer: &NodeId, _timeout: Duration) -> Result<Duration> {
        if self.is_connected(peer).await {
            Ok(Duration::from_millis(5))
        } else {
            Err(MeshError::PeerUnreachable {
                peer_id: peer.to_string(),
                context: Default::default(),
            })
        }
    }

    async fn find_node(&self, _peer: &NodeId, _target: &NodeId) -> Result<Vec<PeerInfo>> {
        Ok(Vec::new())
    }

    async fn find_value(&self, _peer: &NodeId, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn store(&self, _peer: &NodeId, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn get_connection_metrics(&self) -> ConnectionMetrics {
        let connected = self.connected.lock().await.len();
        ConnectionMetrics {
            bytes_sent: 0,
            bytes_received: 0,
            connected_peers: connected,
            connection_success_rate: 1.0,
        }
    }

    async fn get_stats(&self) -> TransportStats {
        self.stats.lock().await.clone()
    }
}

pub type SharedTransport = Arc<dyn Transport>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    #[tokio::test]
    async fn mock_transport_tracks_connections() {
        let transport = MockTransport::new();
        let peer = PeerInfo::new(NodeId::random(), "127.0.0.1:9000");
        transport.connect(&peer).await.unwrap();
        assert!(transport.is_connected(&peer.node_id).await);
        transport.disconnect(&peer.node_id).await.unwrap();
        assert!(!transport.is_connected(&peer.node_id).await);
    }
}
