//! Contracts of the systems the engine talks to but does not implement: the
//! yield source the idle balance is parked in, the keeper network that fires
//! scheduled steps, and the token-streaming protocol.
//!
//! All calls are synchronous and fallible. A failure aborts the event that
//! issued the call; the engine never retries.

mod memory;
mod normalized;

pub use memory::{InMemoryKeeper, InMemoryStreaming, InMemoryYieldSource};
pub use normalized::NormalizedYieldSource;

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::{Fixed, SignedRate};

/// Deterministic identity of a keeper task.
pub type TaskId = B256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("yield source: {0}")]
    YieldSource(String),

    #[error("keeper: {0}")]
    Keeper(String),

    #[error("streaming protocol: {0}")]
    Streaming(String),
}

/// Yield earned since the previous report, in raw ledger units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct YieldReport {
    /// Yield accrued since the last report.
    pub accrued: u128,
    /// Total value currently held by the yield source.
    pub total_held: u128,
}

pub trait YieldSource {
    fn report_yield(&mut self, now: u64) -> Result<YieldReport, CollaboratorError>;

    fn deposit(&mut self, amount: u128) -> Result<(), CollaboratorError>;

    fn withdraw(&mut self, amount: u128) -> Result<(), CollaboratorError>;

    /// Smallest amount, in ledger units, the source moves without truncating.
    /// Deposits and withdrawals are whole multiples of it.
    fn granularity(&self) -> u128 {
        1
    }
}

pub trait Keeper {
    fn schedule_task(&mut self, id: TaskId, exec_timestamp: u64) -> Result<(), CollaboratorError>;

    fn cancel_task(&mut self, id: TaskId) -> Result<(), CollaboratorError>;
}

pub trait StreamingProtocol {
    /// Collateral the protocol locks for a stream of `rate`.
    fn flow_deposit(&self, rate: SignedRate) -> Result<Fixed, CollaboratorError>;

    /// Opens, resizes or (with `rate == 0`) closes the pool's stream to `receiver`.
    fn set_outflow(&mut self, receiver: Address, rate: SignedRate)
    -> Result<(), CollaboratorError>;
}
