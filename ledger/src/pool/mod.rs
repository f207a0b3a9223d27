//! The pool ledger: one snapshot, replaced on every mutation and versioned by
//! `id`.

pub mod accumulator;

use serde::{Deserialize, Serialize};

use crate::math::{Fixed, SignedRate};

/// Time-weighted average of the annualised yield rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Apy {
    /// Seconds covered by the average.
    pub span: u64,
    /// Annualised rate scaled by `PRECISION` (1_000_000 = 100%).
    pub apy: u128,
}

/// Global pool state.
///
/// Deposit-like fields are `Fixed` (scaled by `PRECISION`). Yield fields and
/// `pool_total_balance` are raw asset units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub id: u64,
    pub timestamp: u64,

    /// Realised deposits of all participants.
    pub deposit: Fixed,
    /// Inbound stream value accrued but not yet realised by a settlement.
    pub deposit_from_in_flow_rate: Fixed,
    /// Outbound stream value accrued but not yet realised by a settlement.
    pub deposit_from_out_flow_rate: Fixed,

    pub in_flow_rate: SignedRate,
    pub out_flow_rate: SignedRate,

    /// Collateral reserved for all open outgoing streams.
    pub out_flow_buffer: Fixed,

    pub yield_token_index: Fixed,
    pub yield_in_flow_rate_index: Fixed,
    pub yield_out_flow_rate_index: Fixed,

    pub yield_accrued: u128,
    pub yield_snapshot: u128,
    pub total_yield: u128,
    pub protocol_yield: u128,

    /// Balance held by the pool itself, outside the yield source.
    pub pool_total_balance: u128,

    pub apy: Apy,

    pub nr_suppliers: u32,
}

impl PoolSnapshot {
    /// Fresh pool opened at `timestamp`.
    pub fn genesis(timestamp: u64) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }

    pub fn indices(&self) -> IndexCheckpoint {
        IndexCheckpoint {
            yield_token_index: self.yield_token_index,
            yield_in_flow_rate_index: self.yield_in_flow_rate_index,
            yield_out_flow_rate_index: self.yield_out_flow_rate_index,
        }
    }
}

/// The three index values a participant last settled against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCheckpoint {
    pub yield_token_index: Fixed,
    pub yield_in_flow_rate_index: Fixed,
    pub yield_out_flow_rate_index: Fixed,
}
