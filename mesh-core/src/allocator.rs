//! Adaptive replica allocator: maps (size, demand, budget) to a replica
//! count and chunk layout. The size/budget band tables live in
//! `AllocatorConfig` as data, mirroring `P2pConfig::adjust_for_conditions`'s
//! habit of exposing tunables rather than hardcoding them into match arms.

use serde::{Deserialize, Serialize};

use crate::config::ReplicationConfig;

#[derive(Debug, Clone, Copy)]
pub struct ResourceDescriptor {
    pub size_bytes: u64,
    pub demand: f32,
    pub budget: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkDistribution {
    pub total_size: u64,
    pub chunk_size: u64,
    pub num_chunks: u64,
    pub last_chunk_size: u64,
}

const DEFAULT_CHUNK_SIZE: u64 = 1 << 20; // 1 MB
const LARGE_CHUNK_SIZE: u64 = 4 << 20; // 4 MB
const LARGE_TOTAL_THRESHOLD: u64 = 10 * (1 << 30); // 10 GB

pub struct AdaptiveAllocator {
    config: ReplicationConfig,
}

impl AdaptiveAllocator {
    pub fn new(config: ReplicationConfig) -> Self {
        Self { config }
    }

    /// Monotone step function on size, then scaled by demand and a budget
    /// band, clamped to [min_replicas, max_replicas].
    pub fn calculate_replicas(&self, resource: ResourceDescriptor) -> u32 {
        let base = self.base_replicas_for_size(resource.size_bytes);
        let demand_multiplier = 1.0 + resource.demand.clamp(0.0, self.config.demand_multiplier_cap);
        let budget_multiplier = budget_band_multiplier(resource.budget);
        let scaled = (base as f32 * demand_multiplier * budget_multiplier).round() as u32;
        scaled.clamp(self.config.base_replicas, self.config.max_replicas)
    }

    fn base_replicas_for_size(&self, size_bytes: u64) -> u32 {
        let steps = &self.config.size_steps_bytes;
        let mut replicas = self.config.base_replicas;
        for (idx, &boundary) in steps.iter().enumerate() {
            if size_bytes > boundary {
                // Each step roughly doubles replica pressure, capped by
                // max_replicas below.
                replicas = self.config.base_replicas * (2u32.pow((idx + 1) as u32));
            }
        }
        replicas.min(self.config.max_replicas)
    }

    pub fn calculate_chunk_distribution(&self, total_size: u64) -> ChunkDistribution {
        let chunk_size = if total_size > LARGE_TOTAL_THRESHOLD {
            LARGE_CHUNK_SIZE
        } else {
            DEFAULT_CHUNK_SIZE
        };
        if total_size == 0 {
            return ChunkDistribution {
                total_size: 0,
                chunk_size,
                num_chunks: 0,
                last_chunk_size: 0,
            };
        }
        let num_chunks = total_size.div_ceil(chunk_size);
        let remainder = total_size % chunk_size;
        let last_chunk_size = if remainder == 0 { chunk_size } else { remainder };
        ChunkDistribution {
            total_size,
            chunk_size,
            num_chunks,
            last_chunk_size,
        }
    }

    pub fn calculate_storage_cost(&self, size_bytes: u64, price_per_mb: f64) -> f64 {
        mb(size_bytes) * price_per_mb
    }

    pub fn calculate_retrieval_cost(&self, size_bytes: u64, price_per_mb: f64) -> f64 {
        mb(size_bytes) * price_per_mb
    }

    pub fn estimate_network_load(&self, size_bytes: u64, replicas: u32, avg_bandwidth_kbps: u32) -> NetworkLoadEstimate {
        let total_bytes = size_bytes * replicas as u64;
        let per_node_bytes = size_bytes;
        let bits = per_node_bytes as f64 * 8.0;
        let eta_secs = if avg_bandwidth_kbps == 0 {
            f64::INFINITY
        } else {
            bits / (avg_bandwidth_kbps as f64 * 1000.0)
        };
        NetworkLoadEstimate {
            total_bytes,
            per_node_bytes,
            eta_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkLoadEstimate {
    pub total_bytes: u64,
    pub per_node_bytes: u64,
    pub eta_secs: f64,
}

fn mb(size_bytes: u64) -> f64 {
    size_bytes as f64 / (1 << 20) as f64
}

fn budget_band_multiplier(budget: f32) -> f32 {
    if budget <= 0.0 {
        0.5
    } else if budget < 0.3 {
        0.7
    } else if budget < 0.7 {
        1.0
    } else if budget < 1.0 {
        1.2
    } else {
        1.5
    }
}
