//! Core mesh primitives: DHT routing, gossip dissemination, economic
//! settlement, and the coordinator that binds them into a running node.
//! See `mesh-node` for the binary that wires these against a real
//! transport/storage backend.

pub mod allocator;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod delegation;
pub mod dispatcher;
pub mod error;
pub mod gossip;
pub mod ledger;
pub mod merkle;
pub mod metrics;
pub mod reputation;
pub mod routing;
pub mod selector;
pub mod storage;
pub mod transport;
pub mod types;
pub mod vault;

pub use config::MeshConfig;
pub use coordinator::Coordinator;
pub use error::{MeshError, Result};
pub use types::{Chunk, ChunkHash, Did, NodeId, PeerInfo};
