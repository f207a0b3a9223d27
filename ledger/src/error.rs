use alloy_primitives::Address;
use thiserror::Error;

use crate::collaborators::CollaboratorError;
use crate::math::MathError;

/// Rejection reason for outflows that would eat into reserved collateral.
pub const NOT_ENOUGH_BALANCE_WITH_OUTFLOW: &str = "NOT_ENOUGH_BALANCE:WITH_OUTFLOW";

/// Rejection reason for withdrawals and transfers beyond the available balance.
pub const NOT_ENOUGH_BALANCE: &str = "NOT_ENOUGH_BALANCE";

/// Rejection reason for withdrawals the pool and its yield source together
/// cannot pay out.
pub const NOT_ENOUGH_LIQUIDITY: &str = "NOT_ENOUGH_LIQUIDITY";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{reason}: required {required}, available {available}")]
    InsufficientBalance {
        reason: &'static str,
        required: u128,
        available: u128,
    },

    #[error("timestamp {requested} precedes pool timestamp {current}")]
    TimestampRegression { requested: u64, current: u64 },

    #[error("amount must be greater than zero")]
    InvalidAmount,

    #[error("invalid stream rate {0}")]
    InvalidRate(i128),

    #[error("participant {0} already has a stream in the opposite direction")]
    ConflictingStream(Address),

    #[error("participant {0} has no active {1} stream")]
    NoActiveStream(Address, &'static str),

    #[error("unknown participant {0}")]
    UnknownParticipant(Address),

    #[error("participant {0} cannot transfer to itself")]
    SelfTransfer(Address),

    #[error(transparent)]
    Math(#[from] MathError),

    #[error("external adapter failure: {0}")]
    Collaborator(#[from] CollaboratorError),
}
