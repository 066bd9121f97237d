//! Local content-addressed storage engine, consumed only. Out of scope per
//! the purpose statement; this crate defines the contract the coordinator
//! calls into and an in-memory mock for tests, grounded on the shape of the
//! teacher's storage crate (`store_cas_chunk`/`retrieve_cas_chunk`) without
//! reusing its encryption/compression internals.

use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{MeshError, Result};
use crate::types::ChunkHash;

#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    async fn store_chunk(&self, hash: &ChunkHash, data: bytes::Bytes) -> Result<()>;
    async fn fetch_chunk(&self, hash: &ChunkHash) -> Result<bytes::Bytes>;
    async fn has_chunk(&self, hash: &ChunkHash) -> bool;
    async fn chunk_count(&self) -> usize;
}

#[derive(Default)]
pub struct MockStorage {
    chunks: DashMap<ChunkHash, bytes::Bytes>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Storage for MockStorage {
    async fn store_chunk(&self, hash: &ChunkHash, data: bytes::Bytes) -> Result<()> {
        self.chunks.insert(*hash, data);
        Ok(())
    }

    async fn fetch_chunk(&self, hash: &ChunkHash) -> Result<bytes::Bytes> {
        self.chunks
            .get(hash)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MeshError::ChunkNotFound {
                chunk_hash: hash.to_string(),
                context: Default::default(),
            })
    }

    async fn has_chunk(&self, hash: &ChunkHash) -> bool {
        self.chunks.contains_key(hash)
    }

    async fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

pub type SharedStorage = Arc<dyn Storage>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Chunk;

    #[tokio::test]
    async fn stores_and_fetches_round_trip() {
        let storage = MockStorage::new();
        let chunk = Chunk::new(b"hello world".to_vec());
        storage.store_chunk(&chunk.hash, chunk.data.clone()).await.unwrap();
        assert!(storage.has_chunk(&chunk.hash).await);
        let fetched = storage.fetch_chunk(&chunk.hash).await.unwrap();
        assert_eq!(fetched, chunk.data);
    }

    #[tokio::test]
    async fn missing_chunk_errors() {
        let storage = MockStorage::new();
        let hash = ChunkHash::of(b"missing");
        assert!(storage.fetch_chunk(&hash).await.is_err());
    }
}
