use alloy_primitives::Address;
use anyhow::Result;
use async_trait::async_trait;

use ledger::{ParticipantState, PoolSnapshot};

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Snapshot with the highest id, if any was ever written.
    async fn latest_pool(&self) -> Result<Option<PoolSnapshot>>;

    /// Latest snapshot taken at or before `timestamp`.
    async fn pool_at(&self, timestamp: u64) -> Result<Option<PoolSnapshot>>;

    /// Page of participants in address order. A row that cannot be decoded
    /// fails the whole page.
    async fn fetch_participants(&self, limit: usize, offset: usize)
    -> Result<Vec<ParticipantState>>;

    async fn fetch_participant(&self, address: &Address) -> Result<Option<ParticipantState>>;

    /// Writes one event's result: the new snapshot and every participant it
    /// touched, in a single transaction.
    async fn persist(&self, pool: &PoolSnapshot, participants: &[ParticipantState]) -> Result<()>;
}
