//! Weighted multi-factor peer selector, grounded on `PeerScore::total_score`
//! in `ml/src/p2p/distributed.rs`, generalized to the spec's five factors
//! and tie-broken by insertion order like that scoring routine.

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};
use crate::types::PeerInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub weight_reputation: f32,
    pub weight_latency: f32,
    pub weight_bandwidth: f32,
    pub weight_region: f32,
    pub weight_freshness: f32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            weight_reputation: 0.40,
            weight_latency: 0.25,
            weight_bandwidth: 0.20,
            weight_region: 0.10,
            weight_freshness: 0.05,
        }
    }
}

impl SelectorConfig {
    pub fn validate(&self) -> Result<()> {
        let sum = self.weight_reputation
            + self.weight_latency
            + self.weight_bandwidth
            + self.weight_region
            + self.weight_freshness;
        if (sum - 1.0).abs() > 0.01 {
            return Err(MeshError::Configuration {
                field: "selector.weights".to_string(),
                value: sum.to_string(),
                expected: "sum to ~1.0".to_string(),
            });
        }
        Ok(())
    }
}

pub struct PeerSelector {
    config: SelectorConfig,
}

impl PeerSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, peer: &PeerInfo, reputation: f32, local_region: Option<&str>, now_ms: u64) -> f32 {
        let latency = latency_subscore(peer.latency_ms);
        let bandwidth = bandwidth_subscore(peer.bandwidth_kbps);
        let region = region_subscore(peer.region.as_deref(), local_region);
        let freshness = freshness_subscore(now_ms.saturating_sub(peer.last_seen_ms));

        reputation.clamp(0.0, 1.0) * self.config.weight_reputation
            + latency * self.config.weight_latency
            + bandwidth * self.config.weight_bandwidth
            + region * self.config.weight_region
            + freshness * self.config.weight_freshness
    }

    /// Selects the best-scoring peer, breaking ties by insertion order (the
    /// first-seen candidate wins).
    pub fn select_best<'a>(
        &self,
        peers: &'a [PeerInfo],
        reputations: impl Fn(&PeerInfo) -> f32,
        local_region: Option<&str>,
        now_ms: u64,
    ) -> Option<&'a PeerInfo> {
        peers
            .iter()
            .enumerate()
            .map(|(idx, peer)| (idx, peer, self.score(peer, reputations(peer), local_region, now_ms)))
            .max_by(|a, b| {
                a.2.partial_cmp(&b.2)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.0.cmp(&a.0))
            })
            .map(|(_, peer, _)| peer)
    }
}

fn latency_subscore(latency_ms: u32) -> f32 {
    if latency_ms == 0 {
        return 1.0;
    }
    if latency_ms >= 1000 {
        return 0.01;
    }
    1.0 / (1.0 + 0.01 * latency_ms as f32)
}

fn bandwidth_subscore(bandwidth_kbps: u32) -> f32 {
    (bandwidth_kbps as f32 / 1_000_000.0).min(1.0)
}

fn region_subscore(peer_region: Option<&str>, local_region: Option<&str>) -> f32 {
    let (Some(peer), Some(local)) = (peer_region, local_region) else {
        return 0.5;
    };
    if peer == local {
        1.0
    } else if peer.len() >= 2 && local.len() >= 2 && peer[..2] == local[..2] {
        0.7
    } else if peer.len() >= 1 && local.len() >= 1 && peer[..1] == local[..1] {
        0.4
    } else {
        0.1
    }
}

fn freshness_subscore(age_ms: u64) -> f32 {
    const MINUTE: u64 = 60_000;
    const HOUR: u64 = 3_600_000;
    const DAY: u64 = 86_400_000;
    if age_ms < MINUTE {
        1.0
    } else if age_ms < HOUR {
        0.5
    } else if age_ms < DAY {
        0.2
    } else {
        0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    #[test]
    fn default_weights_validate() {
        assert!(SelectorConfig::default().validate().is_ok());
    }

    #[test]
    fn unbalanced_weights_are_rejected() {
        let mut config = SelectorConfig::default();
        config.weight_reputation = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn higher_reputation_scores_higher() {
        let selector = PeerSelector::new(SelectorConfig::default());
        let mut good = PeerInfo::new(NodeId::random(), "a");
        good.latency_ms = 10;
        good.bandwidth_kbps = 10_000;
        let mut bad = good.clone();
        bad.node_id = NodeId::random();

        let score_good = selector.score(&good, 0.95, None, 0);
        let score_bad = selector.score(&bad, 0.2, None, 0);
        assert!(score_good > score_bad);
    }

    #[test]
    fn exact_region_match_beats_no_match() {
        let selector = PeerSelector::new(SelectorConfig::default());
        let mut peer_same = PeerInfo::new(NodeId::random(), "a");
        peer_same.region = Some("us".to_string());
        let mut peer_diff = peer_same.clone();
        peer_diff.node_id = NodeId::random();
        peer_diff.region = Some("eu".to_string());

        let same = selector.score(&peer_same, 0.5, Some("us"), 0);
        let diff = selector.score(&peer_diff, 0.5, Some("us"), 0);
        assert!(same > diff);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let selector = PeerSelector::new(SelectorConfig::default());
        let peer_a = PeerInfo::new(NodeId::random(), "a");
        let mut peer_b = peer_a.clone();
        peer_b.node_id = NodeId::random();
        let peers = vec![peer_a.clone(), peer_b];
        let best = selector.select_best(&peers, |_| 0.5, None, 0).unwrap();
        assert_eq!(best.node_id, peer_a.node_id);
    }
}
