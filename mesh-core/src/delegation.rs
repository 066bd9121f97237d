//! Delegation engine: decides whether an operation should run locally or be
//! handed to the mesh, and the terminal verifiers that check a delegated
//! result's digest. Grounded on the teacher's trait + in-memory-default
//! pairing (`ChunkLoader`/`StorageChunkLoader`, `ModelRegistry`/
//! `InMemoryModelRegistry`) for `SystemLoadProvider`/`StaticLoadProvider`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::DelegationConfig;
use crate::error::{MeshError, Result};

/// Where a delegation decision points compute: entirely local, to a
/// mesh peer reachable with sub-10ms latency, or to a remote mesh peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelegationTarget {
    Local,
    MeshLocal,
    MeshRemote,
}

/// Source of the local machine's current load, in [0, 1]. Abstracted so
/// the EMA-driven compute_speedup term is testable without real OS
/// sampling.
pub trait SystemLoadProvider: Send + Sync {
    fn current_load(&self) -> f32;
}

pub struct StaticLoadProvider(pub f32);

impl Default for StaticLoadProvider {
    fn default() -> Self {
        Self(0.3)
    }
}

impl SystemLoadProvider for StaticLoadProvider {
    fn current_load(&self) -> f32 {
        self.0.clamp(0.0, 1.0)
    }
}

struct EmaState {
    load: f32,
    latency_ms: f32,
}

/// Computes the efficiency score steering should-delegate decisions, with
/// an internal EMA (alpha = config.load_ema_alpha) smoothing both the
/// local-load and observed network-latency inputs across calls.
pub struct DelegationEngine {
    config: DelegationConfig,
    load_provider: Box<dyn SystemLoadProvider>,
    ema: Mutex<EmaState>,
}

impl DelegationEngine {
    pub fn new(config: DelegationConfig, load_provider: Box<dyn SystemLoadProvider>) -> Self {
        Self {
            config,
            load_provider,
            ema: Mutex::new(EmaState {
                load: 0.0,
                latency_ms: 0.0,
            }),
        }
    }

    /// `efficiency = 0.4*transferEfficiency + 0.3*computeSpeedup +
    /// 0.2*energyEfficiency + 0.1*priorityFactor`. transferEfficiency
    /// decays with bytes*latency; computeSpeedup tracks EMA local load
    /// (more load locally makes delegating more attractive); priority
    /// above 200 pulls the job back toward local execution.
    pub fn compute_efficiency(&self, bytes: u64, observed_latency_ms: u32, priority: u32) -> f32 {
        let mut ema = self.ema.lock();
        let alpha = self.config.load_ema_alpha;
        ema.load = ema.load * (1.0 - alpha) + self.load_provider.current_load() * alpha;
        ema.latency_ms = ema.latency_ms * (1.0 - alpha) + observed_latency_ms as f32 * alpha;

        let transfer_efficiency = transfer_efficiency(bytes, ema.latency_ms);
        let compute_speedup = ema.load.clamp(0.0, 1.0);
        let energy_efficiency = 0.6; // assumed remote/local energy cost ratio; no local sensor to sample
        let priority_factor = if priority > 200 { 0.2 } else { 1.0 };

        self.config.efficiency_transfer_weight * transfer_efficiency
            + self.config.efficiency_compute_weight * compute_speedup
            + self.config.efficiency_energy_weight * energy_efficiency
            + self.config.efficiency_priority_weight * priority_factor
    }

    pub fn should_delegate(&self, efficiency: f32) -> bool {
        efficiency > 0.7
    }

    pub fn decide_target(&self, efficiency: f32, candidate_latency_ms: u32) -> DelegationTarget {
        if efficiency < 0.3 {
            DelegationTarget::Local
        } else if candidate_latency_ms < 10 {
            DelegationTarget::MeshLocal
        } else {
            DelegationTarget::MeshRemote
        }
    }
}

fn transfer_efficiency(bytes: u64, latency_ms: f32) -> f32 {
    const SCALE: f64 = 1.0e9;
    let cost = bytes as f64 * latency_ms.max(0.0) as f64;
    (-cost / SCALE).exp() as f32
}

/// Terminal pass/fail comparison of an expected vs. actual digest.
pub struct DigestValidator;

impl DigestValidator {
    pub fn validate(expected: &[u8], actual: &[u8]) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(MeshError::DigestMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
                context: Default::default(),
            })
        }
    }
}

/// Accumulates processed bytes/chunks for a streamed operation, then
/// finalizes against a remote-computed digest. Single-use: `finalize`
/// consumes no further state changes are accepted after it returns.
pub struct StreamingVerifier {
    hasher: blake3::Hasher,
    bytes_processed: u64,
    chunks_processed: u64,
}

impl Default for StreamingVerifier {
    fn default() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            bytes_processed: 0,
            chunks_processed: 0,
        }
    }
}

impl StreamingVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes_processed += chunk.len() as u64;
        self.chunks_processed += 1;
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    pub fn chunks_processed(&self) -> u64 {
        self.chunks_processed
    }

    pub fn finalize(self, remote_digest: &[u8]) -> Result<()> {
        let local_digest = self.hasher.finalize();
        DigestValidator::validate(local_digest.as_bytes(), remote_digest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerifierPhase {
    AwaitingResult,
    Terminal,
}

/// Pairs an `input_digest` with the operation it authorizes. `set_result`
/// records the remote's claimed output digest and execution time; `verify`
/// is then a one-shot terminal check against the expected digest.
pub struct DelegationVerifier {
    pub input_digest: Vec<u8>,
    pub operation: String,
    output_digest: Option<Vec<u8>>,
    exec_time_ms: Option<u64>,
    phase: VerifierPhase,
}

impl DelegationVerifier {
    pub fn new(input_digest: Vec<u8>, operation: impl Into<String>) -> Self {
        Self {
            input_digest,
            operation: operation.into(),
            output_digest: None,
            exec_time_ms: None,
            phase: VerifierPhase::AwaitingResult,
        }
    }

    pub fn set_result(&mut self, output_digest: Vec<u8>, exec_time_ms: u64) -> Result<()> {
        if self.phase != VerifierPhase::AwaitingResult {
            return Err(MeshError::EscrowStateViolation {
                escrow_id: self.operation.clone(),
                expected: "AwaitingResult".to_string(),
                actual: "Terminal".to_string(),
                context: Default::default(),
            });
        }
        self.output_digest = Some(output_digest);
        self.exec_time_ms = Some(exec_time_ms);
        Ok(())
    }

    pub fn verify(&mut self, expected_digest: &[u8]) -> Result<()> {
        if self.phase == VerifierPhase::Terminal {
            return Err(MeshError::EscrowStateViolation {
                escrow_id: self.operation.clone(),
                expected: "AwaitingResult".to_string(),
                actual: "Terminal".to_string(),
                context: Default::default(),
            });
        }
        self.phase = VerifierPhase::Terminal;
        let actual = self.output_digest.as_deref().ok_or_else(|| MeshError::EscrowStateViolation {
            escrow_id: self.operation.clone(),
            expected: "result set".to_string(),
            actual: "none".to_string(),
            context: Default::default(),
        })?;
        DigestValidator::validate(expected_digest, actual)
    }

    pub fn exec_time_ms(&self) -> Option<u64> {
        self.exec_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_transfer_at_high_latency_lowers_efficiency() {
        let engine = DelegationEngine::new(DelegationConfig::default(), Box::new(StaticLoadProvider(0.0)));
        let small_fast = engine.compute_efficiency(1_000, 1, 0);
        let engine2 = DelegationEngine::new(DelegationConfig::default(), Box::new(StaticLoadProvider(0.0)));
        let huge_slow = engine2.compute_efficiency(1_000_000_000, 500, 0);
        assert!(small_fast > huge_slow);
    }

    #[test]
    fn high_priority_job_favors_local_execution() {
        let low_priority_engine = DelegationEngine::new(DelegationConfig::default(), Box::new(StaticLoadProvider(0.9)));
        let high_priority_engine = DelegationEngine::new(DelegationConfig::default(), Box::new(StaticLoadProvider(0.9)));
        let low_priority_efficiency = low_priority_engine.compute_efficiency(1_000, 1, 0);
        let high_priority_efficiency = high_priority_engine.compute_efficiency(1_000, 1, 250);
        assert!(high_priority_efficiency < low_priority_efficiency);
    }

    #[test]
    fn heavily_loaded_local_machine_prefers_delegation() {
        let idle_engine = DelegationEngine::new(DelegationConfig::default(), Box::new(StaticLoadProvider(0.0)));
        let busy_engine = DelegationEngine::new(DelegationConfig::default(), Box::new(StaticLoadProvider(1.0)));
        let mut idle_eff = 0.0;
        let mut busy_eff = 0.0;
        for _ in 0..10 {
            idle_eff = idle_engine.compute_efficiency(1_000, 1, 0);
            busy_eff = busy_engine.compute_efficiency(1_000, 1, 0);
        }
        assert!(busy_eff > idle_eff);
        assert!(idle_engine.should_delegate(idle_eff) == (idle_eff > 0.7));
        let _ = busy_eff;
    }

    #[test]
    fn target_selection_follows_efficiency_and_latency_bands() {
        let engine = DelegationEngine::new(DelegationConfig::default(), Box::new(StaticLoadProvider(0.0)));
        assert_eq!(engine.decide_target(0.1, 5), DelegationTarget::Local);
        assert_eq!(engine.decide_target(0.5, 5), DelegationTarget::MeshLocal);
        assert_eq!(engine.decide_target(0.5, 50), DelegationTarget::MeshRemote);
    }

    #[test]
    fn digest_validator_rejects_mismatch() {
        assert!(DigestValidator::validate(b"abc", b"abc").is_ok());
        assert!(DigestValidator::validate(b"abc", b"xyz").is_err());
    }

    #[test]
    fn streaming_verifier_matches_accumulated_hash() {
        let mut verifier = StreamingVerifier::new();
        verifier.accumulate(b"hello ");
        verifier.accumulate(b"world");
        let expected = blake3::hash(b"hello world");
        assert!(verifier.finalize(expected.as_bytes()).is_ok());
    }

    #[test]
    fn delegation_verifier_is_one_shot() {
        let mut verifier = DelegationVerifier::new(b"input".to_vec(), "hash");
        verifier.set_result(b"digest".to_vec(), 42).unwrap();
        assert!(verifier.verify(b"digest").is_ok());
        assert!(verifier.verify(b"digest").is_err());
    }

    #[test]
    fn delegation_verifier_rejects_verify_before_result() {
        let mut verifier = DelegationVerifier::new(b"input".to_vec(), "hash");
        assert!(verifier.verify(b"digest").is_err());
    }
}
