//! Outflow collateral and step scheduling.
//!
//! An outgoing stream is backed by a buffer of `rate · window` that stays in
//! the participant's deposit, and by a keeper task armed for the moment the
//! balance falls to that buffer plus the minimum balance. A keeper running up
//! to one window late is paid for out of the buffer. When the task fires the
//! participant is settled and the stream is either re-armed for the new
//! exhaustion time or closed.
//
//  Pure: the dispatcher performs the keeper calls these plans describe.

use alloy_primitives::{Address, U256, keccak256};

use crate::collaborators::TaskId;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, NOT_ENOUGH_BALANCE_WITH_OUTFLOW};
use crate::math::{self, Fixed, SignedRate};

/// Collateral reserved for a stream of `rate`, scaled.
pub fn buffer_for(rate: SignedRate, cfg: &LedgerConfig) -> Result<Fixed, LedgerError> {
    let units = buffer_units(rate, cfg)?;
    Ok(math::scale(units)?)
}

fn buffer_units(rate: SignedRate, cfg: &LedgerConfig) -> Result<u128, LedgerError> {
    let rate = math::rate_magnitude(rate)?;
    Ok(math::mul(rate, cfg.buffer_window_secs as u128, "buffer")?)
}

/// Part of the balance an outgoing stream of `rate` may not spend, raw units.
pub fn reserve_for(rate: SignedRate, cfg: &LedgerConfig) -> Result<u128, LedgerError> {
    Ok(math::add(buffer_units(rate, cfg)?, cfg.out_min_balance, "out_reserve")?)
}

/// Buffer drawn down by a stream whose settled `balance` sits below its
/// reserve, scaled and capped at the buffer.
pub fn buffer_consumed(
    balance: u128,
    rate: SignedRate,
    cfg: &LedgerConfig,
) -> Result<Fixed, LedgerError> {
    let buffer = buffer_units(rate, cfg)?;
    let consumed = reserve_for(rate, cfg)?.saturating_sub(balance).min(buffer);
    Ok(math::scale(consumed)?)
}

/// Seconds `balance` (raw units) lasts at `rate`.
pub fn stream_duration(balance: u128, rate: SignedRate) -> Result<u64, LedgerError> {
    let rate = math::rate_magnitude(rate)?;
    if rate == 0 {
        return Err(LedgerError::InvalidRate(0));
    }
    Ok(u64::try_from(balance / rate).unwrap_or(u64::MAX))
}

/// Rejects an outgoing stream whose buffer the participant cannot fund on top
/// of the configured minimum balance.
pub fn check_collateral(
    balance: u128,
    rate: SignedRate,
    cfg: &LedgerConfig,
) -> Result<(), LedgerError> {
    let required = buffer_units(rate, cfg)?;
    let available = balance.saturating_sub(cfg.out_min_balance);

    if required > available {
        return Err(LedgerError::InsufficientBalance {
            reason: NOT_ENOUGH_BALANCE_WITH_OUTFLOW,
            required,
            available,
        });
    }
    Ok(())
}

/// Deterministic id of the step task for `participant` due at `exec_timestamp`.
///
/// Hashes the keeper registration the task would be created with:
/// `creator ‖ target ‖ selector ‖ abi(participant, exec_timestamp) ‖ fee_token`.
pub fn task_id(cfg: &LedgerConfig, participant: Address, exec_timestamp: u64) -> TaskId {
    let mut buf = Vec::with_capacity(20 + 20 + 4 + 64 + 20);
    buf.extend_from_slice(cfg.keeper_creator.as_slice());
    buf.extend_from_slice(cfg.step_target.as_slice());
    buf.extend_from_slice(&cfg.step_selector);
    buf.extend_from_slice(participant.into_word().as_slice());
    buf.extend_from_slice(&U256::from(exec_timestamp).to_be_bytes::<32>());
    buf.extend_from_slice(cfg.fee_token.as_slice());
    keccak256(&buf)
}

/// Where the next step of a stream lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPlan {
    pub task_id: TaskId,
    pub stream_init: u64,
    pub stream_duration: u64,
}

impl StepPlan {
    pub fn exec_timestamp(&self) -> u64 {
        self.stream_init.saturating_add(self.stream_duration)
    }
}

/// Arms the step for when `balance` streamed at `rate` reaches the reserve.
pub fn plan_step(
    cfg: &LedgerConfig,
    participant: Address,
    balance: u128,
    rate: SignedRate,
    now: u64,
) -> Result<StepPlan, LedgerError> {
    let spendable = balance.saturating_sub(reserve_for(rate, cfg)?);
    let stream_duration = stream_duration(spendable, rate)?;
    let exec = now.saturating_add(stream_duration);

    Ok(StepPlan {
        task_id: task_id(cfg, participant, exec),
        stream_init: now,
        stream_duration,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    Rearm(StepPlan),
    Close,
}

/// Decides what a fired step does with a freshly settled `balance`.
pub fn evaluate_step(
    cfg: &LedgerConfig,
    participant: Address,
    balance: u128,
    rate: SignedRate,
    now: u64,
) -> Result<StepDecision, LedgerError> {
    let spendable = balance.saturating_sub(reserve_for(rate, cfg)?);
    if stream_duration(spendable, rate)? == 0 {
        return Ok(StepDecision::Close);
    }
    Ok(StepDecision::Rearm(plan_step(cfg, participant, balance, rate, now)?))
}
