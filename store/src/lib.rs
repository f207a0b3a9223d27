//! Persistence for the ledger and the serialized service in front of it.

pub mod db;
pub mod repository;
pub mod repository_sqlx;
pub mod service;

pub use db::Db;
pub use repository::LedgerRepository;
pub use repository_sqlx::SqlxLedgerRepository;
pub use service::LedgerService;
