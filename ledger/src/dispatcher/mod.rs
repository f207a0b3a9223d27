//! Event dispatcher: the only way state changes.
//!
//! Every event runs the same protocol against a staged copy of the ledger:
//! advance the pool, settle whoever the event touches, apply the event's
//! delta, then commit. An error anywhere drops the staged copy, so a failed
//! event leaves the ledger exactly as it was.

mod handlers;
mod ledger;

pub use ledger::Ledger;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::collaborators::{Keeper, StreamingProtocol, TaskId, YieldSource};
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::math::{Fixed, SignedRate};
use crate::pool::accumulator;

use ledger::Staged;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Deposit { amount: u128 },
    Withdraw { amount: u128 },
    Transfer { to: Address, amount: u128 },
    StreamStart { rate: SignedRate },
    StreamUpdate { rate: SignedRate },
    StreamStop,
    OutStreamStart { rate: SignedRate },
    OutStreamUpdate { rate: SignedRate },
    OutStreamStop,
    PushToStrategy,
    WithdrawStep { task_id: TaskId },
    Rebalance,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Deposit { .. } => "DEPOSIT",
            Event::Withdraw { .. } => "WITHDRAW",
            Event::Transfer { .. } => "TRANSFER",
            Event::StreamStart { .. } => "STREAM_START",
            Event::StreamUpdate { .. } => "STREAM_UPDATE",
            Event::StreamStop => "STREAM_STOP",
            Event::OutStreamStart { .. } => "OUT_STREAM_START",
            Event::OutStreamUpdate { .. } => "OUT_STREAM_UPDATE",
            Event::OutStreamStop => "OUT_STREAM_STOP",
            Event::PushToStrategy => "PUSH_TO_STRATEGY",
            Event::WithdrawStep { .. } => "WITHDRAW_STEP",
            Event::Rebalance => "REBALANCE",
        }
    }
}

/// An event and the account that caused it. Pool-level events (strategy
/// pushes, rebalances, keeper steps) carry `Address::ZERO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Address,
    pub event: Event,
}

impl Envelope {
    pub fn new(sender: Address, event: Event) -> Self {
        Self { sender, event }
    }

    pub fn pool(event: Event) -> Self {
        Self::new(Address::ZERO, event)
    }
}

/// Which side of the pool a stream runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDirection {
    /// Participant streams into the pool.
    Inbound,
    /// Pool streams out to the participant.
    Outbound,
}

/// Rate change reported by the streaming protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowChange {
    pub participant: Address,
    pub direction: FlowDirection,
    pub old_rate: SignedRate,
    pub new_rate: SignedRate,
}

impl FlowChange {
    pub fn inbound(participant: Address, old_rate: SignedRate, new_rate: SignedRate) -> Self {
        Self {
            participant,
            direction: FlowDirection::Inbound,
            old_rate,
            new_rate,
        }
    }

    pub fn outbound(participant: Address, old_rate: SignedRate, new_rate: SignedRate) -> Self {
        Self {
            participant,
            direction: FlowDirection::Outbound,
            old_rate,
            new_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    StepRearmed {
        participant: Address,
        task_id: TaskId,
        exec_timestamp: u64,
    },
    StreamClosed {
        participant: Address,
        /// Part of the buffer the stream ate past its planned close, scaled.
        buffer_consumed: Fixed,
        /// Outflow the participant's deposit could not cover, scaled. Non-zero
        /// only when the step ran later than the buffer window.
        shortfall: Fixed,
    },
    /// Nothing but the pool advance was committed.
    Ignored { reason: &'static str },
}

/// What a committed event wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub pool_id: u64,
    pub timestamp: u64,
    /// Participants written by the event, in address order.
    pub touched: Vec<Address>,
    #[serde(flatten)]
    pub outcome: EventOutcome,
}

/// Applies events to a [`Ledger`], talking to the three collaborators.
pub struct Dispatcher<Y, K, S> {
    config: LedgerConfig,
    yield_source: Y,
    keeper: K,
    streaming: S,
}

impl<Y, K, S> Dispatcher<Y, K, S>
where
    Y: YieldSource,
    K: Keeper,
    S: StreamingProtocol,
{
    pub fn new(config: LedgerConfig, yield_source: Y, keeper: K, streaming: S) -> Self {
        Self {
            config,
            yield_source,
            keeper,
            streaming,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn yield_source(&self) -> &Y {
        &self.yield_source
    }

    pub fn yield_source_mut(&mut self) -> &mut Y {
        &mut self.yield_source
    }

    pub fn keeper(&self) -> &K {
        &self.keeper
    }

    pub fn keeper_mut(&mut self) -> &mut K {
        &mut self.keeper
    }

    pub fn streaming(&self) -> &S {
        &self.streaming
    }

    pub fn streaming_mut(&mut self) -> &mut S {
        &mut self.streaming
    }

    pub fn into_parts(self) -> (Y, K, S) {
        (self.yield_source, self.keeper, self.streaming)
    }

    #[instrument(
        skip(self, ledger, envelope),
        target = "dispatcher",
        fields(sender = %envelope.sender, event = envelope.event.kind())
    )]
    pub fn apply(
        &mut self,
        ledger: &mut Ledger,
        now: u64,
        envelope: Envelope,
    ) -> Result<Receipt, LedgerError> {
        let mut tx = ledger.stage();

        self.advance(&mut tx, now)?;
        let outcome = self.dispatch(&mut tx, now, &envelope)?;

        let changes = tx.finish();
        let receipt = Receipt {
            pool_id: changes.pool.id,
            timestamp: changes.pool.timestamp,
            touched: changes.addresses(),
            outcome,
        };
        ledger.commit(changes);

        debug!(pool_id = receipt.pool_id, touched = receipt.touched.len(), "event committed");
        Ok(receipt)
    }

    /// Streaming protocol callback: maps a rate change on one of the pool's
    /// streams to the matching start, update or stop event.
    pub fn on_flow_changed(
        &mut self,
        ledger: &mut Ledger,
        now: u64,
        change: FlowChange,
    ) -> Result<Receipt, LedgerError> {
        let FlowChange {
            participant,
            direction,
            old_rate,
            new_rate,
        } = change;

        let event = match (direction, old_rate, new_rate) {
            (_, 0, 0) => return Err(LedgerError::InvalidRate(0)),
            (FlowDirection::Inbound, 0, rate) => Event::StreamStart { rate },
            (FlowDirection::Inbound, _, 0) => Event::StreamStop,
            (FlowDirection::Inbound, _, rate) => Event::StreamUpdate { rate },
            (FlowDirection::Outbound, 0, rate) => Event::OutStreamStart { rate },
            (FlowDirection::Outbound, _, 0) => Event::OutStreamStop,
            (FlowDirection::Outbound, _, rate) => Event::OutStreamUpdate { rate },
        };
        self.apply(ledger, now, Envelope::new(participant, event))
    }

    /// Keeper callback for a due step task.
    pub fn execute_step(
        &mut self,
        ledger: &mut Ledger,
        now: u64,
        task_id: TaskId,
    ) -> Result<Receipt, LedgerError> {
        self.apply(ledger, now, Envelope::pool(Event::WithdrawStep { task_id }))
    }

    /// Moves the staged pool to `now`. The yield source is only asked for a
    /// report when time has passed.
    fn advance(&mut self, tx: &mut Staged<'_>, now: u64) -> Result<(), LedgerError> {
        if now < tx.pool.timestamp {
            return Err(LedgerError::TimestampRegression {
                requested: now,
                current: tx.pool.timestamp,
            });
        }
        if now == tx.pool.timestamp {
            return Ok(());
        }

        let report = self.yield_source.report_yield(now)?;
        tx.pool = accumulator::advance(&tx.pool, now, report, self.config.protocol_fee_bps)?;
        Ok(())
    }
}
