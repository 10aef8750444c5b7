//! Session seam between the connection manager and a concrete ledger client.
//!
//! The connection manager only ever talks to a [`LedgerSession`]; sessions are
//! opened through a [`LedgerConnector`]. The websocket implementation lives in
//! `ws.rs`, tests plug in an in-memory ledger.

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, TxHash, B256, U256};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::blockchain::types::{LedgerReceipt, LedgerResult, LedgerTransaction, ObservedLog};

/// Block tag used when reading a sender's transaction count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceTag {
    /// Count including transactions still in the node's pending pool.
    Pending,
    /// Count of transactions mined in the latest block.
    Latest,
}

/// Log filter scoped to one contract and one event signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub topic0: B256,
    pub from_block: u64,
}

impl LogFilter {
    pub fn starting_at(self, from_block: u64) -> Self {
        Self { from_block, ..self }
    }
}

/// Stream of logs delivered by a live subscription. Ends when the session drops it.
pub type LogStream = BoxStream<'static, ObservedLog>;

/// One open session to a ledger node.
#[async_trait]
pub trait LedgerSession: Send + Sync {
    /// False once the underlying transport is known to be gone.
    fn is_alive(&self) -> bool;

    async fn chain_id(&self) -> LedgerResult<u64>;

    async fn block_number(&self) -> LedgerResult<u64>;

    async fn balance(&self, address: Address) -> LedgerResult<U256>;

    async fn transaction_count(&self, address: Address, tag: NonceTag) -> LedgerResult<u64>;

    async fn gas_price(&self) -> LedgerResult<u128>;

    async fn transaction(&self, hash: TxHash) -> LedgerResult<Option<LedgerTransaction>>;

    async fn receipt(&self, hash: TxHash) -> LedgerResult<Option<LedgerReceipt>>;

    /// Read-only contract call (`eth_call`).
    async fn call(&self, to: Address, input: Bytes) -> LedgerResult<Bytes>;

    /// Historical logs matching `filter` up to and including `to_block`.
    async fn logs(&self, filter: LogFilter, to_block: u64) -> LedgerResult<Vec<ObservedLog>>;

    /// Broadcast a signed payload. Errors are `SubmissionNetwork` or `SubmissionRejected`.
    async fn send_raw(&self, raw: Bytes) -> LedgerResult<TxHash>;

    /// Live log subscription for new blocks.
    async fn subscribe_logs(&self, filter: LogFilter) -> LedgerResult<LogStream>;

    async fn close(&self);
}

/// Opens sessions to the configured endpoint.
#[async_trait]
pub trait LedgerConnector: Send + Sync {
    async fn open(&self, endpoint: &str) -> LedgerResult<Arc<dyn LedgerSession>>;
}
