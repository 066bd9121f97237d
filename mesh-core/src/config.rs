use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{MeshError, Result};

/// Aggregate configuration for a mesh node. Grouped by subsystem so each
/// component can be handed just its slice rather than the whole struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub routing: RoutingConfig,
    pub gossip: GossipConfig,
    pub reputation: ReputationConfig,
    pub cache: CacheConfig,
    pub replication: ReplicationConfig,
    pub delegation: DelegationConfig,
    pub ledger: LedgerConfig,
    pub coordinator: CoordinatorConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            gossip: GossipConfig::default(),
            reputation: ReputationConfig::default(),
            cache: CacheConfig::default(),
            replication: ReplicationConfig::default(),
            delegation: DelegationConfig::default(),
            ledger: LedgerConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl MeshConfig {
    pub fn validate(&self) -> Result<()> {
        self.routing.validate()?;
        self.gossip.validate()?;
        self.reputation.validate()?;
        self.cache.validate()?;
        self.replication.validate()?;
        self.delegation.validate()?;
        self.ledger.validate()?;
        self.coordinator.validate()?;
        Ok(())
    }

    pub fn low_bandwidth() -> Self {
        let mut cfg = Self::default();
        cfg.gossip.fanout = 3;
        cfg.gossip.push_interval_ms = 2000;
        cfg.cache.max_entries = 256;
        cfg.replication.base_replicas = 2;
        cfg
    }

    pub fn high_performance() -> Self {
        let mut cfg = Self::default();
        cfg.gossip.fanout = 12;
        cfg.gossip.push_interval_ms = 200;
        cfg.cache.max_entries = 16_384;
        cfg.routing.alpha = 5;
        cfg
    }
}

fn err_cfg(field: &str, value: impl std::fmt::Display, expected: &str) -> MeshError {
    MeshError::Configuration {
        field: field.to_string(),
        value: value.to_string(),
        expected: expected.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Bits per k-bucket; k=20 is the spec default, matching Kademlia.
    pub k: usize,
    /// Parallelism of iterative lookups (alpha).
    pub alpha: usize,
    pub lookup_timeout_ms: u64,
    pub bucket_refresh_interval_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            lookup_timeout_ms: 5_000,
            bucket_refresh_interval_ms: 3_600_000,
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(err_cfg("routing.k", self.k, "> 0"));
        }
        if self.alpha == 0 {
            return Err(err_cfg("routing.alpha", self.alpha, "> 0"));
        }
        Ok(())
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    pub fanout: usize,
    pub push_interval_ms: u64,
    pub pull_interval_ms: u64,
    pub seen_ttl_ms: u64,
    pub max_outbound_per_peer: usize,
    pub rate_limit_per_sec: u32,
    pub rate_limit_burst: u32,
    pub anti_entropy_interval_ms: u64,
    pub bloom_expected_items: usize,
    pub bloom_false_positive_rate: f64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 6,
            push_interval_ms: 1_000,
            pull_interval_ms: 5_000,
            seen_ttl_ms: 60_000,
            max_outbound_per_peer: 64,
            rate_limit_per_sec: 50,
            rate_limit_burst: 100,
            anti_entropy_interval_ms: 30_000,
            bloom_expected_items: 10_000,
            bloom_false_positive_rate: 0.01,
        }
    }
}

impl GossipConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fanout == 0 {
            return Err(err_cfg("gossip.fanout", self.fanout, "> 0"));
        }
        if !(0.0..1.0).contains(&self.bloom_false_positive_rate) {
            return Err(err_cfg(
                "gossip.bloom_false_positive_rate",
                self.bloom_false_positive_rate,
                "in [0, 1)",
            ));
        }
        Ok(())
    }

    pub fn seen_ttl(&self) -> Duration {
        Duration::from_millis(self.seen_ttl_ms)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationConfig {
    pub initial_score: f32,
    pub min_trusted_score: f32,
    pub decay_half_life_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_open_duration_ms: u64,
    pub circuit_half_open_probes: u32,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            initial_score: 0.5,
            min_trusted_score: 0.2,
            decay_half_life_ms: 3_600_000,
            circuit_failure_threshold: 5,
            circuit_open_duration_ms: 30_000,
            circuit_half_open_probes: 3,
        }
    }
}

impl ReputationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.initial_score) {
            return Err(err_cfg(
                "reputation.initial_score",
                self.initial_score,
                "in [0, 1]",
            ));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(err_cfg(
                "reputation.circuit_failure_threshold",
                self.circuit_failure_threshold,
                "> 0",
            ));
        }
        Ok(())
    }

    pub fn circuit_open_duration(&self) -> Duration {
        Duration::from_millis(self.circuit_open_duration_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub entry_ttl_ms: u64,
    pub demand_half_life_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 4_096,
            entry_ttl_ms: 300_000,
            demand_half_life_ms: 600_000,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(err_cfg("cache.max_entries", self.max_entries, "> 0"));
        }
        Ok(())
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_millis(self.entry_ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub base_replicas: u32,
    pub max_replicas: u32,
    pub demand_multiplier_cap: f32,
    /// Step boundaries (bytes) used by the size->replica step function.
    pub size_steps_bytes: Vec<u64>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            base_replicas: 3,
            max_replicas: 16,
            demand_multiplier_cap: 4.0,
            size_steps_bytes: vec![1 << 20, 16 << 20, 256 << 20],
        }
    }
}

impl ReplicationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_replicas == 0 {
            return Err(err_cfg(
                "replication.base_replicas",
                self.base_replicas,
                "> 0",
            ));
        }
        if self.max_replicas < self.base_replicas {
            return Err(err_cfg(
                "replication.max_replicas",
                self.max_replicas,
                ">= base_replicas",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationConfig {
    pub load_ema_alpha: f32,
    pub max_concurrent_shards: usize,
    pub efficiency_transfer_weight: f32,
    pub efficiency_compute_weight: f32,
    pub efficiency_energy_weight: f32,
    pub efficiency_priority_weight: f32,
    pub verification_timeout_ms: u64,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            load_ema_alpha: 0.2,
            max_concurrent_shards: 8,
            efficiency_transfer_weight: 0.4,
            efficiency_compute_weight: 0.3,
            efficiency_energy_weight: 0.2,
            efficiency_priority_weight: 0.1,
            verification_timeout_ms: 10_000,
        }
    }
}

impl DelegationConfig {
    pub fn validate(&self) -> Result<()> {
        let sum = self.efficiency_transfer_weight
            + self.efficiency_compute_weight
            + self.efficiency_energy_weight
            + self.efficiency_priority_weight;
        if (sum - 1.0).abs() > 0.01 {
            return Err(err_cfg(
                "delegation.efficiency_weights",
                sum,
                "sum to ~1.0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub worker_fee_bps: u32,
    pub treasury_fee_bps: u32,
    pub creator_fee_bps: u32,
    pub referrer_fee_bps: u32,
    pub close_fee_bps: u32,
    pub escrow_default_expiry_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            worker_fee_bps: 9_500,
            treasury_fee_bps: 350,
            creator_fee_bps: 50,
            referrer_fee_bps: 50,
            close_fee_bps: 50,
            escrow_default_expiry_ms: 900_000,
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<()> {
        let total = self.worker_fee_bps
            + self.treasury_fee_bps
            + self.creator_fee_bps
            + self.referrer_fee_bps
            + self.close_fee_bps;
        if total != 10_000 {
            return Err(err_cfg("ledger.fee_split_bps", total, "sum to 10000"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub metrics_interval_ms: u64,
    pub health_interval_ms: u64,
    pub cache_cleanup_interval_ms: u64,
    pub epoch_interval_ms: u64,
    pub max_fetch_retries: u32,
    pub fetch_backoff_base_ms: u64,
    pub capability_fetch_concurrency: usize,
    pub chunk_provider_ttl_secs: u64,
    pub parallel_shard_timeout_ms: u64,
    pub compression_threshold_bytes: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            metrics_interval_ms: 10_000,
            health_interval_ms: 30_000,
            cache_cleanup_interval_ms: 60_000,
            epoch_interval_ms: 5_000,
            max_fetch_retries: 3,
            fetch_backoff_base_ms: 100,
            capability_fetch_concurrency: 10,
            chunk_provider_ttl_secs: 3_600,
            parallel_shard_timeout_ms: 30_000,
            compression_threshold_bytes: 8_192,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capability_fetch_concurrency == 0 {
            return Err(err_cfg(
                "coordinator.capability_fetch_concurrency",
                self.capability_fetch_concurrency,
                "> 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(MeshConfig::default().validate().is_ok());
    }

    #[test]
    fn fee_split_must_sum_to_10000() {
        let mut cfg = LedgerConfig::default();
        cfg.worker_fee_bps = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn presets_still_validate() {
        assert!(MeshConfig::low_bandwidth().validate().is_ok());
        assert!(MeshConfig::high_performance().validate().is_ok());
    }
}
