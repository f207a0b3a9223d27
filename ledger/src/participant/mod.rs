//! Per-participant ledger entries.
//!
//! A participant is only ever written while settled against the pool snapshot
//! it is being mutated with; between events its stored values lag the pool
//! and must be read through [`settlement`].

pub mod settlement;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::collaborators::TaskId;
use crate::math::{self, Fixed, SignedRate};
use crate::pool::{IndexCheckpoint, PoolSnapshot};

pub use settlement::{Settlement, realtime_balance, settle};

/// Bookkeeping for a participant's outgoing stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutStream {
    pub flow: SignedRate,
    /// Seconds the balance at `stream_init` can fund at `flow`.
    pub stream_duration: u64,
    pub stream_init: u64,
    /// Live keeper task. Any other id that reaches the engine is stale.
    pub cancel_task_id: Option<TaskId>,
    /// Collateral reserved in `pool.out_flow_buffer` for this stream.
    pub buffer: Fixed,
}

impl OutStream {
    pub fn is_active(&self) -> bool {
        self.flow > 0
    }

    pub fn next_exec(&self) -> u64 {
        self.stream_init.saturating_add(self.stream_duration)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub address: Address,
    /// Realised balance as of `timestamp`, scaled.
    pub deposit: Fixed,
    pub timestamp: u64,

    pub in_flow: SignedRate,
    /// Collateral the streaming protocol locks on the sender's side for the
    /// inbound stream. Recorded for reporting; it is not part of the balance
    /// and does not limit what the participant may move.
    pub in_flow_deposit: Fixed,

    pub out_flow: SignedRate,
    pub out_stream: OutStream,

    /// Net yield credited so far, scaled.
    pub cumulated_yield: Fixed,

    pub checkpoint: IndexCheckpoint,
}

impl ParticipantState {
    /// Empty entry anchored at the pool's current time and indices, so it
    /// earns nothing for the past.
    pub fn new(address: Address, pool: &PoolSnapshot) -> Self {
        Self {
            address,
            deposit: 0,
            timestamp: pool.timestamp,
            in_flow: 0,
            in_flow_deposit: 0,
            out_flow: 0,
            out_stream: OutStream::default(),
            cumulated_yield: 0,
            checkpoint: pool.indices(),
        }
    }

    pub fn has_inflow(&self) -> bool {
        self.in_flow > 0
    }

    pub fn has_outflow(&self) -> bool {
        self.out_flow > 0
    }

    /// Realised balance in raw units. Only meaningful right after a settlement.
    pub fn balance(&self) -> u128 {
        math::unscale(self.deposit)
    }
}
