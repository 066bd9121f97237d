//! Economic ledger: accounts, escrows, and settlement with protocol-fee
//! splitting. Node-local by default; when a vault is attached it becomes
//! the source of truth for balances, per the design note on economic
//! conservation under a vault.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::LedgerConfig;
use crate::error::{MeshError, Result};
use crate::types::{now_ms, Did, NodeId};
use crate::vault::SharedVault;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowStatus {
    Pending,
    Locked,
    Released,
    Refunded,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationEscrow {
    pub id: String,
    pub requester_did: Did,
    pub provider_did: Option<Did>,
    pub amount: i64,
    pub status: EscrowStatus,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub settled_at_ms: Option<u64>,
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardContribution {
    pub peer_id: NodeId,
    pub shard_index: usize,
    pub shard_size: u64,
    pub verified: bool,
    pub latency_ms: u32,
    pub completed_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedEscrow {
    pub id: String,
    pub requester_did: Did,
    pub total_amount: i64,
    pub shard_count: usize,
    pub contributions: Vec<ShardContribution>,
    pub status: EscrowStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementResult {
    pub success: bool,
    pub amount: i64,
    pub status: EscrowStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LedgerSnapshot {
    pub accounts: HashMap<String, i64>,
    pub escrows: Vec<DelegationEscrow>,
    pub shared_escrows: Vec<SharedEscrow>,
}

struct LedgerState {
    accounts: HashMap<Did, i64>,
    escrows: HashMap<String, DelegationEscrow>,
    shared_escrows: HashMap<String, SharedEscrow>,
}

pub struct Ledger {
    state: RwLock<LedgerState>,
    config: LedgerConfig,
    vault: Option<SharedVault>,
    treasury_did: Did,
    /// Fallback creator account for escrows that carry no per-job creator
    /// attribution. Distinct from `treasury_did` so the creator/referrer/
    /// close-ids shares are never silently folded into treasury revenue.
    protocol_creator_did: Did,
}

impl Ledger {
    pub fn new(config: LedgerConfig, treasury_did: Did) -> Self {
        let protocol_creator_did = Did(format!("{}:creator", treasury_did.0));
        Self {
            state: RwLock::new(LedgerState {
                accounts: HashMap::new(),
                escrows: HashMap::new(),
                shared_escrows: HashMap::new(),
            }),
            config,
            vault: None,
            treasury_did,
            protocol_creator_did,
        }
    }

    pub fn attach_vault(&mut self, vault: SharedVault) {
        self.vault = Some(vault);
    }

    pub fn register_account(&self, did: Did, initial: i64) {
        self.state.write().accounts.entry(did).or_insert(initial);
    }

    pub fn ensure_account(&self, did: &Did) {
        self.state.write().accounts.entry(did.clone()).or_insert(0);
    }

    /// Local balance view. Prefers the external vault when attached; the
    /// local map is then a cache, not the source of truth.
    pub async fn get_balance(&self, did: &Did) -> Result<i64> {
        if let Some(vault) = &self.vault {
            return vault.get_balance(did).await;
        }
        Ok(self.state.read().accounts.get(did).copied().unwrap_or(0))
    }

    pub fn create_escrow(
        &self,
        id: impl Into<String>,
        requester: Did,
        amount: i64,
        ttl_ms: u64,
        job_id: impl Into<String>,
    ) -> Result<DelegationEscrow> {
        let id = id.into();
        let mut state = self.state.write();
        if state.escrows.contains_key(&id) {
            return Err(MeshError::DuplicateId {
                id,
                context: Default::default(),
            });
        }
        let balance = *state.accounts.entry(requester.clone()).or_insert(0);
        if balance < amount {
            return Err(MeshError::InsufficientBalance {
                required: amount,
                available: balance,
                context: Default::default(),
            });
        }
        *state.accounts.get_mut(&requester).unwrap() -= amount;

        let escrow = DelegationEscrow {
            id: id.clone(),
            requester_did: requester,
            provider_did: None,
            amount,
            status: EscrowStatus::Locked,
            created_at_ms: now_ms(),
            expires_at_ms: now_ms() + ttl_ms,
            settled_at_ms: None,
            job_id: job_id.into(),
        };
        state.escrows.insert(id, escrow.clone());
        Ok(escrow)
    }

    pub fn assign_provider(&self, id: &str, provider: Did) -> Result<()> {
        let mut state = self.state.write();
        let escrow = state.escrows.get_mut(id).ok_or_else(|| MeshError::EscrowStateViolation {
            escrow_id: id.to_string(),
            expected: "exists".to_string(),
            actual: "missing".to_string(),
            context: Default::default(),
        })?;
        escrow.provider_did = Some(provider);
        Ok(())
    }

    /// Releases escrowed funds to the assigned provider, splitting per the
    /// protocol fee schedule: worker 95%, treasury 3.5%, creator 0.5%,
    /// referrer 0.5% (falls back to creator), close-ids 0.5% (falls back to
    /// creator). An escrow with no creator attribution falls back to the
    /// ledger's `protocol_creator_did`, never to the provider — the worker
    /// share already pays the provider in full.
    pub fn release_to_provider(
        &self,
        id: &str,
        verified: bool,
        creator: Option<Did>,
        referrer: Option<Did>,
        close_ids: Option<Did>,
    ) -> Result<SettlementResult> {
        let mut state = self.state.write();
        let escrow = state.escrows.get(id).cloned().ok_or_else(|| MeshError::EscrowStateViolation {
            escrow_id: id.to_string(),
            expected: "exists".to_string(),
            actual: "missing".to_string(),
            context: Default::default(),
        })?;

        if escrow.status != EscrowStatus::Locked {
            return Err(MeshError::EscrowStateViolation {
                escrow_id: id.to_string(),
                expected: "Locked".to_string(),
                actual: format!("{:?}", escrow.status),
                context: Default::default(),
            });
        }
        let Some(provider) = escrow.provider_did.clone() else {
            return Err(MeshError::EscrowStateViolation {
                escrow_id: id.to_string(),
                expected: "provider assigned".to_string(),
                actual: "none".to_string(),
                context: Default::default(),
            });
        };
        if !verified {
            return Err(MeshError::EscrowStateViolation {
                escrow_id: id.to_string(),
                expected: "verified".to_string(),
                actual: "unverified".to_string(),
                context: Default::default(),
            });
        }

        let shares = split_amount(escrow.amount, &self.config);
        let creator = creator.unwrap_or_else(|| self.protocol_creator_did.clone());
        let referrer = referrer.unwrap_or_else(|| creator.clone());
        let close_ids = close_ids.unwrap_or_else(|| creator.clone());

        *state.accounts.entry(provider).or_insert(0) += shares.worker;
        *state.accounts.entry(self.treasury_did.clone()).or_insert(0) += shares.treasury;
        *state.accounts.entry(creator).or_insert(0) += shares.creator;
        *state.accounts.entry(referrer).or_insert(0) += shares.referrer;
        *state.accounts.entry(close_ids).or_insert(0) += shares.close_ids;

        let escrow = state.escrows.get_mut(id).unwrap();
        escrow.status = EscrowStatus::Released;
        escrow.settled_at_ms = Some(now_ms());

        Ok(SettlementResult {
            success: true,
            amount: escrow.amount,
            status: EscrowStatus::Released,
        })
    }

    pub fn refund_to_requester(&self, id: &str) -> Result<SettlementResult> {
        let mut state = self.state.write();
        let escrow = state.escrows.get(id).cloned().ok_or_else(|| MeshError::EscrowStateViolation {
            escrow_id: id.to_string(),
            expected: "exists".to_string(),
            actual: "missing".to_string(),
            context: Default::default(),
        })?;
        *state.accounts.entry(escrow.requester_did.clone()).or_insert(0) += escrow.amount;
        let escrow_mut = state.escrows.get_mut(id).unwrap();
        escrow_mut.status = EscrowStatus::Refunded;
        escrow_mut.settled_at_ms = Some(now_ms());
        Ok(SettlementResult {
            success: true,
            amount: escrow.amount,
            status: EscrowStatus::Refunded,
        })
    }

    pub fn expire_stale_escrows(&self) -> Vec<String> {
        let mut state = self.state.write();
        let now = now_ms();
        let stale: Vec<String> = state
            .escrows
            .values()
            .filter(|e| e.status == EscrowStatus::Locked && e.expires_at_ms <= now)
            .map(|e| e.id.clone())
            .collect();
        for id in &stale {
            let escrow = state.escrows.get(id).cloned().unwrap();
            *state.accounts.entry(escrow.requester_did.clone()).or_insert(0) += escrow.amount;
            let escrow_mut = state.escrows.get_mut(id).unwrap();
            escrow_mut.status = EscrowStatus::Expired;
            escrow_mut.settled_at_ms = Some(now);
        }
        stale
    }

    /// Settlement entry point: wraps `release_to_provider`/`refund_to_requester`
    /// depending on verification outcome. `latency_ms` is the delegation's
    /// observed round-trip time, carried through for telemetry only — the
    /// coordinator is responsible for feeding it into peer reputation.
    pub fn settle_delegation(&self, id: &str, verified: bool, latency_ms: u32) -> Result<SettlementResult> {
        tracing::debug!(escrow_id = id, verified, latency_ms, "settling delegation");
        if verified {
            self.release_to_provider(id, true, None, None, None)
        } else {
            self.refund_to_requester(id)
        }
    }

    pub fn create_shared_escrow(&self, id: impl Into<String>, requester: Did, total_amount: i64, shard_count: usize) -> Result<SharedEscrow> {
        let id = id.into();
        let mut state = self.state.write();
        if state.shared_escrows.contains_key(&id) {
            return Err(MeshError::DuplicateId {
                id,
                context: Default::default(),
            });
        }
        let balance = *state.accounts.entry(requester.clone()).or_insert(0);
        if balance < total_amount {
            return Err(MeshError::InsufficientBalance {
                required: total_amount,
                available: balance,
                context: Default::default(),
            });
        }
        *state.accounts.get_mut(&requester).unwrap() -= total_amount;
        let escrow = SharedEscrow {
            id: id.clone(),
            requester_did: requester,
            total_amount,
            shard_count,
            contributions: Vec::new(),
            status: EscrowStatus::Locked,
        };
        state.shared_escrows.insert(id, escrow.clone());
        Ok(escrow)
    }

    pub fn record_shard_contribution(&self, id: &str, contribution: ShardContribution) -> Result<()> {
        let mut state = self.state.write();
        let escrow = state.shared_escrows.get_mut(id).ok_or_else(|| MeshError::EscrowStateViolation {
            escrow_id: id.to_string(),
            expected: "exists".to_string(),
            actual: "missing".to_string(),
            context: Default::default(),
        })?;
        escrow.contributions.push(contribution);
        Ok(())
    }

    /// Settles a shared escrow: withholds the protocol fee, then distributes
    /// the remainder to verified workers proportional to shard size. Refunds
    /// in full if no shard was verified.
    pub fn settle_shared_escrow(&self, id: &str, worker_dids: &HashMap<NodeId, Did>) -> Result<SettlementResult> {
        let mut state = self.state.write();
        let escrow = state.shared_escrows.get(id).cloned().ok_or_else(|| MeshError::EscrowStateViolation {
            escrow_id: id.to_string(),
            expected: "exists".to_string(),
            actual: "missing".to_string(),
            context: Default::default(),
        })?;

        let verified_total: u64 = escrow.contributions.iter().filter(|c| c.verified).map(|c| c.shard_size).sum();

        if verified_total == 0 {
            *state.accounts.entry(escrow.requester_did.clone()).or_insert(0) += escrow.total_amount;
            let escrow_mut = state.shared_escrows.get_mut(id).unwrap();
            escrow_mut.status = EscrowStatus::Refunded;
            return Ok(SettlementResult {
                success: true,
                amount: escrow.total_amount,
                status: EscrowStatus::Refunded,
            });
        }

        let protocol_fee = (escrow.total_amount as f64 * 0.05).floor() as i64;
        let distributable = escrow.total_amount - protocol_fee;

        for contribution in escrow.contributions.iter().filter(|c| c.verified) {
            let share = (distributable as f64 * contribution.shard_size as f64 / verified_total as f64).floor() as i64;
            if let Some(did) = worker_dids.get(&contribution.peer_id) {
                *state.accounts.entry(did.clone()).or_insert(0) += share;
            }
        }

        // The held-back protocol fee is simple treasury revenue here; shared
        // escrows don't carry per-job creator/referrer/close attribution.
        *state.accounts.entry(self.treasury_did.clone()).or_insert(0) += protocol_fee;

        let escrow_mut = state.shared_escrows.get_mut(id).unwrap();
        escrow_mut.status = EscrowStatus::Released;

        Ok(SettlementResult {
            success: true,
            amount: escrow.total_amount,
            status: EscrowStatus::Released,
        })
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.read();
        LedgerSnapshot {
            accounts: state.accounts.iter().map(|(did, bal)| (did.0.clone(), *bal)).collect(),
            escrows: state.escrows.values().cloned().collect(),
            shared_escrows: state.shared_escrows.values().cloned().collect(),
        }
    }
}

struct FeeShares {
    worker: i64,
    treasury: i64,
    creator: i64,
    referrer: i64,
    close_ids: i64,
}

/// Splits `amount` by basis points, giving the worker whatever remains
/// after the other shares are floored — invariant 5 (ledger conservation)
/// holds exactly because of this, rather than relying on the complement of
/// a rounded split.
fn split_amount(amount: i64, config: &LedgerConfig) -> FeeShares {
    let treasury = bps_of(amount, config.treasury_fee_bps);
    let creator = bps_of(amount, config.creator_fee_bps);
    let referrer = bps_of(amount, config.referrer_fee_bps);
    let close_ids = bps_of(amount, config.close_fee_bps);
    let worker = amount - treasury - creator - referrer - close_ids;
    FeeShares {
        worker,
        treasury,
        creator,
        referrer,
        close_ids,
    }
}

fn bps_of(amount: i64, bps: u32) -> i64 {
    (amount * bps as i64) / 10_000
}

#[derive(Default)]
pub struct DelegationPricing;

impl DelegationPricing {
    /// `base` per-operation cost scaled by ceil(size / 1MB), with a
    /// priority multiplier at thresholds 100/200.
    pub fn calculate_delegation_cost(operation: &str, size_bytes: u64, priority: u32) -> i64 {
        let base = match operation {
            "hash" => 10,
            "compress" => 50,
            "encrypt" | "decrypt" => 100,
            _ => 200,
        };
        let size_units = size_bytes.div_ceil(1 << 20).max(1) as i64;
        let priority_multiplier = if priority > 200 {
            2.0
        } else if priority > 100 {
            1.5
        } else {
            1.0
        };
        ((base * size_units) as f64 * priority_multiplier).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> Ledger {
        Ledger::new(LedgerConfig::default(), Did("did:mesh:treasury".into()))
    }

    #[tokio::test]
    async fn escrow_happy_path_splits_fees_correctly() {
        let ledger = ledger();
        let alice = Did("did:mesh:alice".into());
        let bob = Did("did:mesh:bob".into());
        ledger.register_account(alice.clone(), 10_000);
        ledger.create_escrow("e1", alice.clone(), 1_000, 3_600_000, "job1").unwrap();
        ledger.assign_provider("e1", bob.clone()).unwrap();
        let result = ledger.settle_delegation("e1", true, 25).unwrap();
        assert!(result.success);
        // No creator/referrer/close-ids given: those three 0.5% shares all
        // fall back to the ledger's protocol creator account, never to bob.
        assert_eq!(ledger.get_balance(&bob).await.unwrap(), 950);
        assert_eq!(ledger.get_balance(&alice).await.unwrap(), 9_000);
        assert_eq!(ledger.get_balance(&ledger.treasury_did).await.unwrap(), 35);
        assert_eq!(ledger.get_balance(&ledger.protocol_creator_did).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn escrow_verification_failure_refunds_requester() {
        let ledger = ledger();
        let alice = Did("did:mesh:alice".into());
        let bob = Did("did:mesh:bob".into());
        ledger.register_account(alice.clone(), 10_000);
        ledger.create_escrow("e1", alice.clone(), 1_000, 3_600_000, "job1").unwrap();
        ledger.assign_provider("e1", bob.clone()).unwrap();
        let result = ledger.settle_delegation("e1", false, 25).unwrap();
        assert_eq!(result.status, EscrowStatus::Refunded);
        assert_eq!(ledger.get_balance(&alice).await.unwrap(), 10_000);
        assert_eq!(ledger.get_balance(&bob).await.unwrap(), 0);
    }

    #[test]
    fn duplicate_escrow_id_is_rejected() {
        let ledger = ledger();
        let alice = Did("did:mesh:alice".into());
        ledger.register_account(alice.clone(), 10_000);
        ledger.create_escrow("e1", alice.clone(), 100, 1000, "job1").unwrap();
        assert!(ledger.create_escrow("e1", alice, 100, 1000, "job1").is_err());
    }

    #[test]
    fn insufficient_balance_rejects_escrow_creation() {
        let ledger = ledger();
        let alice = Did("did:mesh:alice".into());
        ledger.register_account(alice.clone(), 10);
        assert!(ledger.create_escrow("e1", alice, 100, 1000, "job1").is_err());
    }

    #[tokio::test]
    async fn shared_escrow_distributes_proportionally() {
        let ledger = ledger();
        let alice = Did("did:mesh:alice".into());
        let worker_a = Did("did:mesh:worker-a".into());
        let worker_b = Did("did:mesh:worker-b".into());
        ledger.register_account(alice.clone(), 1_000);
        ledger.create_shared_escrow("shared1", alice.clone(), 100, 2).unwrap();

        let peer_a = NodeId::random();
        let peer_b = NodeId::random();
        ledger
            .record_shard_contribution(
                "shared1",
                ShardContribution {
                    peer_id: peer_a,
                    shard_index: 0,
                    shard_size: 256,
                    verified: true,
                    latency_ms: 10,
                    completed_at_ms: now_ms(),
                },
            )
            .unwrap();
        ledger
            .record_shard_contribution(
                "shared1",
                ShardContribution {
                    peer_id: peer_b,
                    shard_index: 1,
                    shard_size: 768,
                    verified: true,
                    latency_ms: 10,
                    completed_at_ms: now_ms(),
                },
            )
            .unwrap();

        let mut workers = HashMap::new();
        workers.insert(peer_a, worker_a.clone());
        workers.insert(peer_b, worker_b.clone());

        ledger.settle_shared_escrow("shared1", &workers).unwrap();
        assert_eq!(ledger.get_balance(&worker_a).await.unwrap(), 23);
        assert_eq!(ledger.get_balance(&worker_b).await.unwrap(), 71);
    }

    #[test]
    fn delegation_cost_scales_with_size_and_priority() {
        let base = DelegationPricing::calculate_delegation_cost("hash", 1 << 19, 0);
        assert_eq!(base, 10);
        let scaled = DelegationPricing::calculate_delegation_cost("hash", 3 << 20, 0);
        assert_eq!(scaled, 30);
        let prioritized = DelegationPricing::calculate_delegation_cost("hash", 1 << 19, 250);
        assert_eq!(prioritized, 20);
    }
}
