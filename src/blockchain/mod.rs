//! Ledger integration subsystem.
//!
//! # Data Flow
//! ```text
//! Secret source (env var, keystore)
//!     → secret.rs (decrypt key material)
//!     → wallet.rs (signing authority: build, sign, hash)
//!
//! Websocket endpoint
//!     → ws.rs (alloy provider behind the session seam in session.rs)
//!     → client.rs (connection manager: reconnects, timeouts, cache.rs single-flight reads)
//!
//! contract.rs (token ABI: call dispatch table, log decoding)
//! transaction.rs (payloads, gas policy, unit conversion)
//! ```
//!
//! # Security Constraints
//! - Private keys never appear in config files or logs
//! - All RPC calls have configurable timeouts
//! - Graceful degradation when the ledger is unreachable

pub mod cache;
pub mod client;
pub mod contract;
pub mod secret;
pub mod session;
pub mod transaction;
pub mod types;
pub mod wallet;
pub mod ws;

pub use client::ConnectionManager;
pub use session::{LedgerConnector, LedgerSession, LogFilter, LogStream, NonceTag};
pub use types::{LedgerError, LedgerReceipt, LedgerResult, LedgerTransaction, ObservedLog};
pub use wallet::SigningAuthority;
pub use ws::WsConnector;
