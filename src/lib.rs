//! Ledger keeper library

pub mod blockchain;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod service;
pub mod transactions;

pub use blockchain::{LedgerError, LedgerResult};
pub use config::schema::KeeperConfig;
pub use lifecycle::Shutdown;
pub use service::{KeeperDeps, LedgerKeeper};
