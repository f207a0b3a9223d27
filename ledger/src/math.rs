//! Scaled-integer arithmetic for the ledger.
//!
//! Every balance-like quantity (`Fixed`) is an unsigned amount multiplied by
//! [`PRECISION`]. Products that can outgrow 128 bits (the index numerators carry
//! `PRECISION²`, a yield amount and a seconds-weighted balance) are evaluated in
//! 256 bits and narrowed back with an overflow check. Seconds-weighted areas are
//! kept in 256 bits throughout and divided with a 512-bit intermediate.

use alloy_primitives::U256;
use alloy_primitives::aliases::U512;
use thiserror::Error;

/// Amount scaled by [`PRECISION`].
pub type Fixed = u128;

/// Units per second. Signed because the streaming protocol reports rate deltas.
pub type SignedRate = i128;

pub const PRECISION: u128 = 1_000_000;

/// Ledger base unit has 18 decimals, the underlying asset of the yield source 6.
pub const UNDERLYING_NORMALIZER: u128 = 1_000_000_000_000;

pub const SECONDS_PER_YEAR: u128 = 365 * 24 * 60 * 60;

pub const BPS_DENOMINATOR: u128 = 10_000;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathError {
    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("arithmetic underflow in {0}")]
    Underflow(&'static str),

    #[error("division by zero in {0}")]
    DivisionByZero(&'static str),

    #[error("negative rate {0} where a magnitude was expected")]
    NegativeRate(i128),
}

pub fn add(a: u128, b: u128, ctx: &'static str) -> Result<u128, MathError> {
    a.checked_add(b).ok_or(MathError::Overflow(ctx))
}

pub fn sub(a: u128, b: u128, ctx: &'static str) -> Result<u128, MathError> {
    a.checked_sub(b).ok_or(MathError::Underflow(ctx))
}

pub fn mul(a: u128, b: u128, ctx: &'static str) -> Result<u128, MathError> {
    a.checked_mul(b).ok_or(MathError::Overflow(ctx))
}

/// `amount · PRECISION`
pub fn scale(amount: u128) -> Result<Fixed, MathError> {
    mul(amount, PRECISION, "scale")
}

/// `value / PRECISION`, truncating.
pub fn unscale(value: Fixed) -> u128 {
    value / PRECISION
}

/// Magnitude of a rate that must not be negative.
pub fn rate_magnitude(rate: SignedRate) -> Result<u128, MathError> {
    u128::try_from(rate).map_err(|_| MathError::NegativeRate(rate))
}

pub fn signed(value: u128, ctx: &'static str) -> Result<i128, MathError> {
    i128::try_from(value).map_err(|_| MathError::Overflow(ctx))
}

/// `Π numerator / Π denominator` with a 256-bit intermediate, truncating.
pub fn wide_ratio(
    numerator: &[u128],
    denominator: &[u128],
    ctx: &'static str,
) -> Result<u128, MathError> {
    let num = wide_product(numerator, ctx)?;
    let den = wide_product(denominator, ctx)?;

    if den.is_zero() {
        return Err(MathError::DivisionByZero(ctx));
    }

    let quotient = num.checked_div(den).ok_or(MathError::DivisionByZero(ctx))?;
    u128::try_from(quotient).map_err(|_| MathError::Overflow(ctx))
}

pub fn wide_product(factors: &[u128], ctx: &'static str) -> Result<U256, MathError> {
    factors.iter().try_fold(U256::from(1u8), |acc, f| {
        acc.checked_mul(U256::from(*f))
            .ok_or(MathError::Overflow(ctx))
    })
}

/// `area · Π factors / (total · base)` for 256-bit areas, truncating.
pub fn area_ratio(
    area: U256,
    factors: &[u128],
    total: U256,
    base: u128,
    ctx: &'static str,
) -> Result<u128, MathError> {
    let num = factors.iter().try_fold(U512::from(area), |acc, f| {
        acc.checked_mul(U512::from(*f))
            .ok_or(MathError::Overflow(ctx))
    })?;
    let den = U512::from(total)
        .checked_mul(U512::from(base))
        .ok_or(MathError::Overflow(ctx))?;

    if den.is_zero() {
        return Err(MathError::DivisionByZero(ctx));
    }
    u128::try_from(num / den).map_err(|_| MathError::Overflow(ctx))
}

/// Ledger (18 decimals) to underlying asset (6 decimals), truncating.
pub fn to_underlying(amount: u128) -> u128 {
    amount / UNDERLYING_NORMALIZER
}

/// Underlying asset (6 decimals) to ledger (18 decimals).
pub fn from_underlying(amount: u128) -> Result<u128, MathError> {
    mul(amount, UNDERLYING_NORMALIZER, "from_underlying")
}
