//! Binary entry point: wires mesh-core against in-memory mock backends and
//! runs a coordinator until Ctrl-C or a fixed duration elapses.

mod config;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ed25519_dalek::SigningKey;
use tracing::info;

use mesh_core::bridge::MockBridge;
use mesh_core::cache::{ChunkCache, DemandTracker};
use mesh_core::config::MeshConfig;
use mesh_core::coordinator::Coordinator;
use mesh_core::delegation::{DelegationEngine, StaticLoadProvider};
use mesh_core::dispatcher::{EchoDispatcher, SharedDispatcher};
use mesh_core::gossip::GossipManager;
use mesh_core::ledger::Ledger;
use mesh_core::reputation::{CircuitBreakerRegistry, ReputationTracker};
use mesh_core::routing::{DhtStore, RoutingTable};
use mesh_core::storage::{MockStorage, SharedStorage};
use mesh_core::transport::{MockTransport, SharedTransport};
use mesh_core::types::{Did, NodeId};

use config::Cli;

#[tokio::main]
async fn main() -> mesh_core::error::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_filter.clone())
        .with_target(false)
        .init();

    let config = MeshConfig::default();
    config.validate()?;

    let local_id = NodeId::random();
    let local_did = Did(format!("did:mesh:{}", local_id.to_hex()));
    info!(node_id = %local_id.to_hex(), region = ?cli.region, "starting mesh node");

    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let routing = Arc::new(RoutingTable::new(local_id, config.routing.clone()));
    let dht_store = Arc::new(DhtStore::new());
    let transport: SharedTransport = Arc::new(MockTransport::new());
    let storage: SharedStorage = Arc::new(MockStorage::new());
    let dispatcher: SharedDispatcher = Arc::new(EchoDispatcher::default());
    let bridge = Arc::new(MockBridge::new(mesh_core::bridge::METRICS_FRAME_BYTES));

    let gossip = Arc::new(GossipManager::new(
        local_id,
        signing_key,
        config.gossip.clone(),
        transport.clone(),
        routing.clone(),
    ));
    let cache = Arc::new(ChunkCache::new(config.cache.clone()));
    let demand = Arc::new(DemandTracker::new(config.cache.demand_half_life_ms));
    let reputation = Arc::new(ReputationTracker::new(config.reputation.clone()));
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.reputation.clone()));

    let mut ledger = Ledger::new(config.ledger.clone(), Did("did:mesh:treasury".to_string()));
    ledger.register_account(local_did.clone(), cli.initial_balance);
    let ledger = Arc::new(ledger);

    let delegation = Arc::new(DelegationEngine::new(
        config.delegation.clone(),
        Box::new(StaticLoadProvider::default()),
    ));

    let coordinator = Arc::new(Coordinator::new(
        local_id,
        cli.region.clone(),
        config,
        routing,
        dht_store,
        gossip,
        cache,
        demand,
        reputation,
        breakers,
        ledger,
        delegation,
        transport,
        storage,
        dispatcher,
        Some(bridge),
    ));

    coordinator.start();

    match cli.run_seconds {
        Some(secs) => {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!(run_seconds = secs, "run duration elapsed, shutting down");
        }
        None => {
            tokio::signal::ctrl_c().await.ok();
            info!("received shutdown signal");
        }
    }

    coordinator.shutdown().await;
    Ok(())
}
