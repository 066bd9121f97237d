//! Persistent economic vault, consumed and optional. When attached, it
//! becomes the source of truth for balances and the ledger's local map
//! degrades to a cache (§9 design note on economic conservation under a
//! vault).

use std::sync::Arc;

use crate::error::Result;
use crate::types::Did;

#[async_trait::async_trait]
pub trait Vault: Send + Sync {
    async fn get_balance(&self, did: &Did) -> Result<i64>;
    async fn grant_bonus(&self, did: &Did, amount: i64) -> Result<()>;
}

/// A vault that additionally supports a reserve/release/refund pending-
/// balance protocol, used by `CreateEscrow` instead of a direct deduction
/// when attached.
#[async_trait::async_trait]
pub trait SealedVault: Vault {
    async fn get_available_balance(&self, did: &Did) -> Result<i64>;
    async fn reserve_pending(&self, did: &Did, amount: i64) -> Result<()>;
    async fn release_pending(&self, did: &Did, amount: i64) -> Result<()>;
    async fn refund_pending(&self, did: &Did, amount: i64) -> Result<()>;
}

pub type SharedVault = Arc<dyn SealedVault>;

#[derive(Default)]
pub struct MockVault {
    balances: dashmap::DashMap<Did, i64>,
    reserved: dashmap::DashMap<Did, i64>,
}

impl MockVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, did: Did, amount: i64) {
        self.balances.insert(did, amount);
    }
}

#[async_trait::async_trait]
impl Vault for MockVault {
    async fn get_balance(&self, did: &Did) -> Result<i64> {
        Ok(self.balances.get(did).map(|v| *v).unwrap_or(0))
    }

    async fn grant_bonus(&self, did: &Did, amount: i64) -> Result<()> {
        *self.balances.entry(did.clone()).or_insert(0) += amount;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SealedVault for MockVault {
    async fn get_available_balance(&self, did: &Did) -> Result<i64> {
        let total = self.get_balance(did).await?;
        let reserved = self.reserved.get(did).map(|v| *v).unwrap_or(0);
        Ok(total - reserved)
    }

    async fn reserve_pending(&self, did: &Did, amount: i64) -> Result<()> {
        *self.reserved.entry(did.clone()).or_insert(0) += amount;
        Ok(())
    }

    async fn release_pending(&self, did: &Did, amount: i64) -> Result<()> {
        *self.reserved.entry(did.clone()).or_insert(0) -= amount;
        *self.balances.entry(did.clone()).or_insert(0) -= amount;
        Ok(())
    }

    async fn refund_pending(&self, did: &Did, amount: i64) -> Result<()> {
        *self.reserved.entry(did.clone()).or_insert(0) -= amount;
        Ok(())
    }
}
