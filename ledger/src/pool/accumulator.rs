//! Index accumulator: advances the pool snapshot over an elapsed interval.
//!
//! Yield reported for the interval is split between three contribution
//! classes in proportion to their deposit-seconds:
//!   - static deposits: `deposit · Δt`
//!   - inbound streams: `depositFromInFlowRate · Δt + inFlowRate · Δt² · P / 2`
//!   - outbound streams, same shape with the outflow fields, counted negatively
//!
//! Each class's share is normalised by its own base (deposit or rate) and
//! added to that class's index. Participants are never visited.
//
//  Pure: no IO, no collaborator calls.

use alloy_primitives::U256;
use tracing::debug;

use super::PoolSnapshot;
use crate::collaborators::YieldReport;
use crate::error::LedgerError;
use crate::math::{self, BPS_DENOMINATOR, PRECISION, SECONDS_PER_YEAR, MathError};

/// Per-interval increments of the three yield indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexDeltas {
    pub token: u128,
    pub in_flow: u128,
    pub out_flow: u128,
}

/// Deposit-seconds contributed by each class over one interval. A scaled
/// 18-decimal balance held for a few weeks already exceeds 128 bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeriodArea {
    pub deposit_seconds: U256,
    pub flow_seconds: U256,
    pub out_flow_seconds: U256,
}

impl PeriodArea {
    /// `deposit + inflow − outflow`, or zero if outflows dominate.
    pub fn total(&self) -> U256 {
        self.deposit_seconds
            .saturating_add(self.flow_seconds)
            .saturating_sub(self.out_flow_seconds)
    }
}

/// Triangular integral of a stream's virtual deposit plus the rectangle of
/// what it had already accumulated.
fn stream_seconds(accumulated: u128, rate: u128, dt: u128) -> Result<U256, MathError> {
    let rectangle = math::wide_product(&[accumulated, dt], "stream_seconds")?;
    let triangle = math::wide_product(&[rate, dt, dt, PRECISION], "stream_seconds")? / U256::from(2u8);
    rectangle
        .checked_add(triangle)
        .ok_or(MathError::Overflow("stream_seconds"))
}

pub fn period_area(last: &PoolSnapshot, dt: u64) -> Result<PeriodArea, LedgerError> {
    let dt = dt as u128;
    let in_rate = math::rate_magnitude(last.in_flow_rate)?;
    let out_rate = math::rate_magnitude(last.out_flow_rate)?;

    Ok(PeriodArea {
        deposit_seconds: math::wide_product(&[last.deposit, dt], "deposit_seconds")?,
        flow_seconds: stream_seconds(last.deposit_from_in_flow_rate, in_rate, dt)?,
        out_flow_seconds: stream_seconds(last.deposit_from_out_flow_rate, out_rate, dt)?,
    })
}

/// Index increments for `yield_amount` earned over `dt` seconds after `last`.
///
/// A class with a zero base (no deposit, no rate) gets no increment, and
/// nothing is distributed when the total area is zero.
pub fn index_deltas(
    last: &PoolSnapshot,
    dt: u64,
    yield_amount: u128,
) -> Result<IndexDeltas, LedgerError> {
    let area = period_area(last, dt)?;
    let total = area.total();

    if total.is_zero() || yield_amount == 0 {
        return Ok(IndexDeltas::default());
    }

    let in_rate = math::rate_magnitude(last.in_flow_rate)?;
    let out_rate = math::rate_magnitude(last.out_flow_rate)?;

    let token = if last.deposit != 0 {
        math::area_ratio(
            area.deposit_seconds,
            &[PRECISION, PRECISION, yield_amount],
            total,
            last.deposit,
            "yield_token_index",
        )?
    } else {
        0
    };

    let in_flow = if in_rate != 0 {
        math::area_ratio(
            area.flow_seconds,
            &[PRECISION, yield_amount],
            total,
            in_rate,
            "yield_in_flow_rate_index",
        )?
    } else {
        0
    };

    let out_flow = if out_rate != 0 {
        math::area_ratio(
            area.out_flow_seconds,
            &[PRECISION, yield_amount],
            total,
            out_rate,
            "yield_out_flow_rate_index",
        )?
    } else {
        0
    };

    Ok(IndexDeltas {
        token,
        in_flow,
        out_flow,
    })
}

/// Advances `last` to `timestamp`, folding in `report`.
///
/// Yield for the interval is `report.total_held − last.yield_snapshot`: the
/// snapshot only moves when an advance is committed, so an aborted event never
/// loses yield. Returns `last` unchanged when no time has elapsed.
pub fn advance(
    last: &PoolSnapshot,
    timestamp: u64,
    report: YieldReport,
    protocol_fee_bps: u16,
) -> Result<PoolSnapshot, LedgerError> {
    if timestamp < last.timestamp {
        return Err(LedgerError::TimestampRegression {
            requested: timestamp,
            current: last.timestamp,
        });
    }
    if timestamp == last.timestamp {
        return Ok(last.clone());
    }

    let dt = timestamp - last.timestamp;
    let dt_wide = dt as u128;

    let accrued = report.total_held.saturating_sub(last.yield_snapshot);
    if accrued != report.accrued {
        debug!(
            reported = report.accrued,
            derived = accrued,
            "yield source report differs from snapshot delta"
        );
    }

    let protocol_cut =
        (math::mul(accrued, protocol_fee_bps as u128, "protocol_fee")? / BPS_DENOMINATOR).min(accrued);
    let distributable = accrued - protocol_cut;

    let deltas = index_deltas(last, dt, distributable)?;

    let in_rate = math::rate_magnitude(last.in_flow_rate)?;
    let out_rate = math::rate_magnitude(last.out_flow_rate)?;
    let inflow = math::mul(in_rate, dt_wide, "inflow")?;
    let outflow = math::mul(out_rate, dt_wide, "outflow")?;

    let mut next = last.clone();
    next.id = last.id + 1;
    next.timestamp = timestamp;

    next.yield_token_index = math::add(last.yield_token_index, deltas.token, "yield_token_index")?;
    next.yield_in_flow_rate_index = math::add(
        last.yield_in_flow_rate_index,
        deltas.in_flow,
        "yield_in_flow_rate_index",
    )?;
    next.yield_out_flow_rate_index = math::add(
        last.yield_out_flow_rate_index,
        deltas.out_flow,
        "yield_out_flow_rate_index",
    )?;

    next.deposit_from_in_flow_rate = math::add(
        last.deposit_from_in_flow_rate,
        math::scale(inflow)?,
        "deposit_from_in_flow_rate",
    )?;
    next.deposit_from_out_flow_rate = math::add(
        last.deposit_from_out_flow_rate,
        math::scale(outflow)?,
        "deposit_from_out_flow_rate",
    )?;

    next.pool_total_balance = math::add(last.pool_total_balance, inflow, "pool_total_balance")?
        .saturating_sub(outflow);

    next.yield_accrued = accrued;
    next.yield_snapshot = report.total_held;
    next.total_yield = math::add(last.total_yield, accrued, "total_yield")?;
    next.protocol_yield = math::add(last.protocol_yield, protocol_cut, "protocol_yield")?;

    next.apy = next_apy(last, dt, distributable);

    debug!(
        pool_id = next.id,
        dt,
        yield_accrued = accrued,
        protocol_cut,
        token_delta = deltas.token,
        in_flow_delta = deltas.in_flow,
        out_flow_delta = deltas.out_flow,
        "pool advanced"
    );

    Ok(next)
}

fn next_apy(last: &PoolSnapshot, dt: u64, yield_amount: u128) -> super::Apy {
    let base = last.pool_total_balance.saturating_add(last.yield_snapshot);
    let dt_wide = dt as u128;

    // Reporting only: saturates rather than failing the advance.
    let period_rate = if base == 0 || yield_amount == 0 {
        0
    } else {
        math::wide_ratio(
            &[yield_amount, PRECISION, SECONDS_PER_YEAR],
            &[dt_wide, base],
            "apy",
        )
        .unwrap_or(u128::MAX)
    };

    let span = last.apy.span.saturating_add(dt);
    let weighted = last
        .apy
        .apy
        .saturating_mul(last.apy.span as u128)
        .saturating_add(period_rate.saturating_mul(dt_wide));

    super::Apy {
        span,
        apy: weighted / span as u128,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(accrued: u128) -> YieldReport {
        YieldReport {
            accrued,
            total_held: accrued,
        }
    }

    #[test]
    fn zero_elapsed_is_a_noop() {
        let pool = PoolSnapshot::genesis(100);
        let next = advance(&pool, 100, report(50), 0).unwrap();
        assert_eq!(next, pool);
    }

    #[test]
    fn going_back_in_time_is_rejected() {
        let pool = PoolSnapshot::genesis(100);
        assert_eq!(
            advance(&pool, 99, report(0), 0),
            Err(LedgerError::TimestampRegression {
                requested: 99,
                current: 100
            })
        );
    }

    #[test]
    fn deposit_only_pool_gets_whole_yield_on_token_index() {
        let mut pool = PoolSnapshot::genesis(0);
        pool.deposit = 50 * PRECISION;

        let next = advance(&pool, 10, report(100), 0).unwrap();

        // P * yield / deposit_units = 1e6 * 100 / 50
        assert_eq!(next.yield_token_index, 2_000_000);
        assert_eq!(next.yield_in_flow_rate_index, 0);
        assert_eq!(next.id, 1);
        assert_eq!(next.total_yield, 100);
    }

    #[test]
    fn empty_pool_accrues_no_index() {
        let pool = PoolSnapshot::genesis(0);
        let next = advance(&pool, 10, report(100), 0).unwrap();

        assert_eq!(next.yield_token_index, 0);
        assert_eq!(next.total_yield, 100);
    }

    #[test]
    fn stream_accumulators_grow_by_rate_times_elapsed() {
        let mut pool = PoolSnapshot::genesis(0);
        pool.in_flow_rate = 10;
        pool.out_flow_rate = 3;
        pool.pool_total_balance = 5;

        let next = advance(&pool, 10, report(0), 0).unwrap();

        assert_eq!(next.deposit_from_in_flow_rate, 100 * PRECISION);
        assert_eq!(next.deposit_from_out_flow_rate, 30 * PRECISION);
        assert_eq!(next.pool_total_balance, 75);
    }

    #[test]
    fn area_splits_deposit_and_stream_contributions() {
        let mut pool = PoolSnapshot::genesis(10);
        pool.deposit = 40 * PRECISION;
        pool.in_flow_rate = 10;
        pool.deposit_from_in_flow_rate = 100 * PRECISION;

        let area = period_area(&pool, 10).unwrap();

        assert_eq!(area.deposit_seconds, U256::from(400 * PRECISION));
        assert_eq!(area.flow_seconds, U256::from(1_500 * PRECISION));
        assert_eq!(area.total(), U256::from(1_900 * PRECISION));
    }

    const UNIT: u128 = 1_000_000_000_000_000_000;
    const DAY: u64 = 86_400;

    #[test]
    fn large_deposit_over_weeks_advances() {
        let mut pool = PoolSnapshot::genesis(0);
        pool.deposit = 100_000_000 * UNIT * PRECISION;
        pool.pool_total_balance = 100_000_000 * UNIT;

        let next = advance(&pool, 40 * DAY, report(1_000 * UNIT), 0).unwrap();

        // P * yield / deposit_units = 1e6 * 1e3 / 1e8
        assert_eq!(next.yield_token_index, 10);
        assert_eq!(next.timestamp, 40 * DAY);
    }

    #[test]
    fn fast_inflow_over_months_advances() {
        let mut pool = PoolSnapshot::genesis(0);
        pool.deposit = 1_000 * UNIT * PRECISION;
        pool.in_flow_rate = (10 * UNIT) as i128;

        let next = advance(&pool, 100 * DAY, report(UNIT), 0).unwrap();
        let area = period_area(&pool, 100 * DAY).unwrap();

        assert!(area.flow_seconds > U256::from(u128::MAX));
        assert_eq!(
            next.deposit_from_in_flow_rate,
            10 * UNIT * (100 * DAY) as u128 * PRECISION
        );
        assert!(next.yield_in_flow_rate_index > 0);
    }

    #[test]
    fn outflow_dominated_area_distributes_nothing() {
        let mut pool = PoolSnapshot::genesis(0);
        pool.out_flow_rate = 5;

        let deltas = index_deltas(&pool, 10, 1_000).unwrap();
        assert_eq!(deltas, IndexDeltas::default());
    }

    #[test]
    fn yield_is_derived_from_snapshot_delta() {
        let mut pool = PoolSnapshot::genesis(0);
        pool.deposit = 50 * PRECISION;
        pool.yield_snapshot = 1_000;

        let report = YieldReport {
            accrued: 999,
            total_held: 1_100,
        };
        let next = advance(&pool, 10, report, 0).unwrap();

        assert_eq!(next.yield_accrued, 100);
        assert_eq!(next.yield_snapshot, 1_100);
        assert_eq!(next.yield_token_index, 2_000_000);
    }

    #[test]
    fn protocol_fee_is_skimmed_before_distribution() {
        let mut pool = PoolSnapshot::genesis(0);
        pool.deposit = 50 * PRECISION;

        let next = advance(&pool, 10, report(100), 1_000).unwrap();

        assert_eq!(next.protocol_yield, 10);
        assert_eq!(next.yield_token_index, 1_800_000);
    }

    #[test]
    fn apy_is_time_weighted() {
        let mut pool = PoolSnapshot::genesis(0);
        pool.deposit = 1_000 * PRECISION;
        pool.pool_total_balance = 1_000;

        // 1 unit over 1 year on 1000 held = 0.1%
        let one_year = SECONDS_PER_YEAR as u64;
        let next = advance(&pool, one_year, report(1), 0).unwrap();
        assert_eq!(next.apy.apy, 1_000);
        assert_eq!(next.apy.span, one_year);

        // A second, yield-free year halves the average.
        let flat = YieldReport {
            accrued: 0,
            total_held: next.yield_snapshot,
        };
        let later = advance(&next, 2 * one_year, flat, 0).unwrap();
        assert_eq!(later.apy.apy, 500);
    }
}
