//! Index-based accounting engine for a pool fed by deposits and continuous
//! token streams, with yield from an external source distributed by
//! time-weighted contribution.
//!
//! Nothing in this crate iterates over participants: the pool advances in O(1)
//! through three yield indices and each participant settles lazily against them
//! the next time an event touches it.

pub mod collaborators;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod math;
pub mod outflow;
pub mod participant;
pub mod pool;
pub mod time;

pub use alloy_primitives::{Address, B256};

pub use config::LedgerConfig;
pub use dispatcher::{
    Dispatcher, Envelope, Event, EventOutcome, FlowChange, FlowDirection, Ledger, Receipt,
};
pub use error::LedgerError;
pub use math::{Fixed, PRECISION, SignedRate};
pub use participant::ParticipantState;
pub use pool::PoolSnapshot;
