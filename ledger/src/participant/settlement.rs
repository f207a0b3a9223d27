//! Lazy settlement of one participant against the current pool snapshot.
//!
//! Settling realises everything that happened to the participant since its
//! last touch:
//!   - yield, as index deltas times the participant's deposit or rates
//!   - stream value, as rate times elapsed seconds
//!
//! Every change to the participant's deposit is mirrored in `pool.deposit`,
//! and the stream value is moved out of the pool's unrealised accumulators.

use tracing::{debug, warn};

use super::ParticipantState;
use crate::collaborators::YieldReport;
use crate::error::LedgerError;
use crate::math::{self, Fixed, PRECISION};
use crate::pool::{PoolSnapshot, accumulator};

/// What one settlement realised, all scaled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settlement {
    /// Net yield: deposit and inflow yield minus outflow yield.
    pub yield_total: i128,
    /// Inbound stream value moved into the deposit.
    pub increment: Fixed,
    /// Outbound stream value taken out of the deposit.
    pub decrement: Fixed,
    /// Part of the debit the deposit could not cover.
    pub shortfall: Fixed,
}

impl Settlement {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Yield gained and yield forgone by `participant` since its checkpoint.
fn pending_yield(
    participant: &ParticipantState,
    pool: &PoolSnapshot,
) -> Result<(Fixed, Fixed), LedgerError> {
    let cp = &participant.checkpoint;

    let token_delta = pool.yield_token_index.saturating_sub(cp.yield_token_index);
    let in_delta = pool
        .yield_in_flow_rate_index
        .saturating_sub(cp.yield_in_flow_rate_index);
    let out_delta = pool
        .yield_out_flow_rate_index
        .saturating_sub(cp.yield_out_flow_rate_index);

    let from_deposit = if token_delta == 0 || participant.deposit == 0 {
        0
    } else {
        math::wide_ratio(
            &[participant.deposit, token_delta],
            &[PRECISION],
            "yield_deposit",
        )?
    };

    let in_rate = math::rate_magnitude(participant.in_flow)?;
    let out_rate = math::rate_magnitude(participant.out_flow)?;

    let from_inflow = math::mul(in_rate, in_delta, "yield_flow")?;
    let lost_to_outflow = math::mul(out_rate, out_delta, "yield_out_flow")?;

    Ok((
        math::add(from_deposit, from_inflow, "yield_gain")?,
        lost_to_outflow,
    ))
}

/// Brings `participant` up to `pool.timestamp`, updating both in place.
///
/// Idempotent: settling twice against the same snapshot realises nothing the
/// second time.
pub fn settle(
    participant: &mut ParticipantState,
    pool: &mut PoolSnapshot,
) -> Result<Settlement, LedgerError> {
    let elapsed = pool.timestamp.saturating_sub(participant.timestamp) as u128;

    let (gain, loss) = pending_yield(participant, pool)?;

    let in_rate = math::rate_magnitude(participant.in_flow)?;
    let out_rate = math::rate_magnitude(participant.out_flow)?;

    let increment = math::scale(math::mul(in_rate, elapsed, "increment")?)?;
    let decrement = math::scale(math::mul(out_rate, elapsed, "decrement")?)?;

    let credit = math::add(
        math::add(participant.deposit, gain, "settle_credit")?,
        increment,
        "settle_credit",
    )?;
    let debit = math::add(loss, decrement, "settle_debit")?;

    let (deposit, shortfall) = if credit >= debit {
        (credit - debit, 0)
    } else {
        (0, debit - credit)
    };

    if shortfall > 0 {
        warn!(
            participant = %participant.address,
            shortfall,
            "outflow drained more than the participant held"
        );
    }

    pool.deposit_from_in_flow_rate = pool.deposit_from_in_flow_rate.saturating_sub(increment);
    pool.deposit_from_out_flow_rate = pool.deposit_from_out_flow_rate.saturating_sub(decrement);

    if deposit >= participant.deposit {
        pool.deposit = math::add(pool.deposit, deposit - participant.deposit, "pool_deposit")?;
    } else {
        pool.deposit = pool.deposit.saturating_sub(participant.deposit - deposit);
    }

    participant.cumulated_yield = if gain >= loss {
        math::add(participant.cumulated_yield, gain - loss, "cumulated_yield")?
    } else {
        participant.cumulated_yield.saturating_sub(loss - gain)
    };

    participant.deposit = deposit;
    participant.timestamp = pool.timestamp;
    participant.checkpoint = pool.indices();

    let yield_total = math::signed(gain, "yield_total")? - math::signed(loss, "yield_total")?;

    let settlement = Settlement {
        yield_total,
        increment,
        decrement,
        shortfall,
    };

    if !settlement.is_empty() {
        debug!(
            participant = %participant.address,
            yield_total,
            increment,
            decrement,
            deposit,
            "participant settled"
        );
    }

    Ok(settlement)
}

/// Balance of `participant` at `now` in raw units, without touching either
/// argument.
///
/// Yield is counted up to the pool's last advance; stream value is projected up
/// to `now`. `now` earlier than the pool timestamp is treated as the pool
/// timestamp.
pub fn realtime_balance(
    participant: &ParticipantState,
    pool: &PoolSnapshot,
    now: u64,
) -> Result<u128, LedgerError> {
    let flat = YieldReport {
        accrued: 0,
        total_held: pool.yield_snapshot,
    };
    let mut projected = accumulator::advance(pool, now.max(pool.timestamp), flat, 0)?;
    let mut participant = participant.clone();

    settle(&mut participant, &mut projected)?;

    Ok(participant.balance())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    fn funded(pool: &mut PoolSnapshot, amount: u128) -> ParticipantState {
        let mut p = ParticipantState::new(Address::repeat_byte(7), pool);
        p.deposit = amount * PRECISION;
        pool.deposit += amount * PRECISION;
        p
    }

    #[test]
    fn deposit_yield_follows_token_index() {
        let mut pool = PoolSnapshot::genesis(0);
        let mut p = funded(&mut pool, 40);

        pool.timestamp = 10;
        pool.yield_token_index = 1_052_631;

        let s = settle(&mut p, &mut pool).unwrap();

        assert_eq!(s.yield_total, 42_105_240);
        assert_eq!(p.deposit, 40 * PRECISION + 42_105_240);
        assert_eq!(pool.deposit, p.deposit);
        assert_eq!(p.cumulated_yield, 42_105_240);
        assert_eq!(p.checkpoint, pool.indices());
    }

    #[test]
    fn inflow_value_moves_from_pool_accumulator_to_deposit() {
        let mut pool = PoolSnapshot::genesis(0);
        let mut p = ParticipantState::new(Address::repeat_byte(2), &pool);
        p.in_flow = 10;
        pool.in_flow_rate = 10;

        pool.timestamp = 10;
        pool.deposit_from_in_flow_rate = 100 * PRECISION;

        let s = settle(&mut p, &mut pool).unwrap();

        assert_eq!(s.increment, 100 * PRECISION);
        assert_eq!(p.deposit, 100 * PRECISION);
        assert_eq!(pool.deposit_from_in_flow_rate, 0);
        assert_eq!(pool.deposit, 100 * PRECISION);
    }

    #[test]
    fn settlement_is_idempotent() {
        let mut pool = PoolSnapshot::genesis(0);
        let mut p = funded(&mut pool, 5);
        p.in_flow = 3;
        pool.in_flow_rate = 3;
        pool.timestamp = 20;
        pool.deposit_from_in_flow_rate = 60 * PRECISION;
        pool.yield_token_index = 2_000_000;
        pool.yield_in_flow_rate_index = 4;

        settle(&mut p, &mut pool).unwrap();
        let (once_p, once_pool) = (p.clone(), pool.clone());

        let again = settle(&mut p, &mut pool).unwrap();

        assert!(again.is_empty());
        assert_eq!(p, once_p);
        assert_eq!(pool, once_pool);
    }

    #[test]
    fn overdrawn_outflow_saturates_and_reports_shortfall() {
        let mut pool = PoolSnapshot::genesis(0);
        let mut p = funded(&mut pool, 10);
        p.out_flow = 2;
        pool.out_flow_rate = 2;

        pool.timestamp = 8;
        pool.deposit_from_out_flow_rate = 16 * PRECISION;

        let s = settle(&mut p, &mut pool).unwrap();

        assert_eq!(p.deposit, 0);
        assert_eq!(s.shortfall, 6 * PRECISION);
        assert_eq!(pool.deposit, 0);
        assert_eq!(pool.deposit_from_out_flow_rate, 0);
    }

    #[test]
    fn outflow_yield_is_subtracted() {
        let mut pool = PoolSnapshot::genesis(0);
        let mut p = funded(&mut pool, 100);
        p.out_flow = 1;
        pool.out_flow_rate = 1;

        pool.timestamp = 10;
        pool.deposit_from_out_flow_rate = 10 * PRECISION;
        pool.yield_out_flow_rate_index = 50;

        let s = settle(&mut p, &mut pool).unwrap();

        assert_eq!(s.yield_total, -50);
        assert_eq!(p.deposit, 90 * PRECISION - 50);
        assert_eq!(pool.deposit, p.deposit);
    }

    #[test]
    fn realtime_balance_projects_streams_without_mutation() {
        let mut pool = PoolSnapshot::genesis(0);
        let mut p = funded(&mut pool, 40);
        p.in_flow = 10;
        pool.in_flow_rate = 10;

        let before = (p.clone(), pool.clone());
        let balance = realtime_balance(&p, &pool, 10).unwrap();

        assert_eq!(balance, 140);
        assert_eq!((p, pool), before);
    }

    #[test]
    fn realtime_balance_before_pool_time_uses_pool_time() {
        let mut pool = PoolSnapshot::genesis(50);
        let p = funded(&mut pool, 3);

        assert_eq!(realtime_balance(&p, &pool, 10).unwrap(), 3);
    }
}
