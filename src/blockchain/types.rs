//! Ledger-facing types and error definitions.

use alloy::primitives::{Address, Bytes, TxHash, B256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Re-export LedgerConfig from config module to avoid duplication
pub use crate::config::schema::LedgerConfig;

/// Errors that can occur while talking to the ledger or preparing a transaction.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// Session unavailable, RPC failure or RPC timeout. Retried by background tasks.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Raw transaction could not reach the node. Does not count as a sending attempt.
    #[error("Submission network error: {0}")]
    SubmissionNetwork(String),

    /// The node refused the payload.
    #[error("Transaction rejected by ledger: {0}")]
    SubmissionRejected(String),

    /// Sender balance does not cover the requested value.
    #[error("Insufficient funds: required {required} wei, available {available} wei")]
    InsufficientFunds { required: U256, available: U256 },

    /// Key material missing, undecryptable or malformed. Halts administrative sends.
    #[error("Key access error: {0}")]
    KeyAccess(String),

    /// Business rule violation detected before any ledger interaction.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Gas price exceeded maximum allowed.
    #[error("Gas price {current_gwei} gwei exceeds maximum {max_gwei} gwei")]
    GasPriceTooHigh { current_gwei: u128, max_gwei: u64 },

    /// Node reports a different chain than configured.
    #[error("Chain ID mismatch: expected {expected}, got {actual}")]
    ChainMismatch { expected: u64, actual: u64 },

}

impl LedgerError {
    /// Whether background tasks should simply try again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Connection(_) | LedgerError::SubmissionNetwork(_)
        )
    }
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// A transaction as returned by a by-hash lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub hash: TxHash,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub value: U256,
    pub gas_price: u128,
    pub input: Bytes,
    pub block_hash: Option<B256>,
    pub block_number: Option<u64>,
}

impl LedgerTransaction {
    /// Mined means included in a block; an empty block hash counts as not mined.
    pub fn is_mined(&self) -> bool {
        matches!(self.block_hash, Some(hash) if hash != B256::ZERO) && self.block_number.is_some()
    }
}

/// Receipt of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub hash: TxHash,
    pub from: Address,
    pub status: bool,
    pub gas_used: u64,
    pub block_number: Option<u64>,
    pub logs: Vec<ObservedLog>,
}

/// A contract event log, either streamed by the watcher or attached to a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedLog {
    pub tx_hash: TxHash,
    pub contract: Address,
    pub data: Bytes,
    pub topics: Vec<B256>,
    pub block_number: u64,
}
