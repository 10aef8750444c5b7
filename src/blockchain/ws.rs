//! Websocket session backed by an alloy provider.
//!
//! # Responsibilities
//! - Open the websocket transport to the configured node
//! - Translate alloy RPC types into the crate's ledger types
//! - Classify submission failures (node refusal vs. transport failure)
//! - Flag the session as dead once the transport reports itself gone

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::consensus::Transaction as ConsensusTransaction;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log, Transaction, TransactionReceipt, TransactionRequest};
use alloy::transports::{RpcError, TransportResult};
use async_trait::async_trait;
use futures_util::{future, StreamExt};
use tokio::time::timeout;

use crate::blockchain::session::{LedgerConnector, LedgerSession, LogFilter, LogStream, NonceTag};
use crate::blockchain::types::{
    LedgerError, LedgerReceipt, LedgerResult, LedgerTransaction, ObservedLog,
};

/// Opens websocket sessions with a bounded handshake.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl LedgerConnector for WsConnector {
    async fn open(&self, endpoint: &str) -> LedgerResult<Arc<dyn LedgerSession>> {
        let connect = ProviderBuilder::new().connect_ws(WsConnect::new(endpoint));
        let provider = match timeout(self.connect_timeout, connect).await {
            Ok(Ok(provider)) => provider,
            Ok(Err(e)) => {
                return Err(LedgerError::Connection(format!(
                    "websocket handshake with {} failed: {}",
                    endpoint, e
                )))
            }
            Err(_) => {
                return Err(LedgerError::Connection(format!(
                    "websocket handshake with {} timed out after {}s",
                    endpoint,
                    self.connect_timeout.as_secs()
                )))
            }
        };

        Ok(Arc::new(WsSession {
            provider: Arc::new(provider) as Arc<dyn Provider + Send + Sync>,
            alive: AtomicBool::new(true),
        }))
    }
}

/// A live websocket session.
pub struct WsSession {
    provider: Arc<dyn Provider + Send + Sync>,
    alive: AtomicBool,
}

impl WsSession {
    fn observe<T>(&self, op: &'static str, result: TransportResult<T>) -> LedgerResult<T> {
        result.map_err(|e| {
            if matches!(e, RpcError::Transport(_)) {
                self.alive.store(false, Ordering::Relaxed);
            }
            LedgerError::Connection(format!("{}: {}", op, e))
        })
    }
}

#[async_trait]
impl LedgerSession for WsSession {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn chain_id(&self) -> LedgerResult<u64> {
        self.observe("eth_chainId", self.provider.get_chain_id().await)
    }

    async fn block_number(&self) -> LedgerResult<u64> {
        self.observe("eth_blockNumber", self.provider.get_block_number().await)
    }

    async fn balance(&self, address: Address) -> LedgerResult<U256> {
        self.observe("eth_getBalance", self.provider.get_balance(address).await)
    }

    async fn transaction_count(&self, address: Address, tag: NonceTag) -> LedgerResult<u64> {
        let request = self.provider.get_transaction_count(address);
        let result = match tag {
            NonceTag::Pending => request.pending().await,
            NonceTag::Latest => request.latest().await,
        };
        self.observe("eth_getTransactionCount", result)
    }

    async fn gas_price(&self) -> LedgerResult<u128> {
        self.observe("eth_gasPrice", self.provider.get_gas_price().await)
    }

    async fn transaction(&self, hash: TxHash) -> LedgerResult<Option<LedgerTransaction>> {
        let tx = self.observe(
            "eth_getTransactionByHash",
            self.provider.get_transaction_by_hash(hash).await,
        )?;
        Ok(tx.map(to_ledger_transaction))
    }

    async fn receipt(&self, hash: TxHash) -> LedgerResult<Option<LedgerReceipt>> {
        let receipt = self.observe(
            "eth_getTransactionReceipt",
            self.provider.get_transaction_receipt(hash).await,
        )?;
        Ok(receipt.map(to_ledger_receipt))
    }

    async fn call(&self, to: Address, input: Bytes) -> LedgerResult<Bytes> {
        let request = TransactionRequest::default().with_to(to).with_input(input);
        self.observe("eth_call", self.provider.call(request).await)
    }

    async fn logs(&self, filter: LogFilter, to_block: u64) -> LedgerResult<Vec<ObservedLog>> {
        let filter = Filter::new()
            .address(filter.address)
            .event_signature(filter.topic0)
            .from_block(filter.from_block)
            .to_block(to_block);
        let logs = self.observe("eth_getLogs", self.provider.get_logs(&filter).await)?;
        Ok(logs.iter().filter_map(to_observed_log).collect())
    }

    async fn send_raw(&self, raw: Bytes) -> LedgerResult<TxHash> {
        match self.provider.send_raw_transaction(&raw).await {
            Ok(pending) => Ok(*pending.tx_hash()),
            Err(RpcError::ErrorResp(payload)) => Err(LedgerError::SubmissionRejected(format!(
                "code {}: {}",
                payload.code, payload.message
            ))),
            Err(e) => {
                if matches!(e, RpcError::Transport(_)) {
                    self.alive.store(false, Ordering::Relaxed);
                }
                Err(LedgerError::SubmissionNetwork(e.to_string()))
            }
        }
    }

    async fn subscribe_logs(&self, filter: LogFilter) -> LedgerResult<LogStream> {
        let filter = Filter::new()
            .address(filter.address)
            .event_signature(filter.topic0);
        let subscription = self.observe("eth_subscribe", self.provider.subscribe_logs(&filter).await)?;
        Ok(subscription
            .into_stream()
            .filter_map(|log| future::ready(to_observed_log(&log)))
            .boxed())
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }
}

fn to_ledger_transaction(tx: Transaction) -> LedgerTransaction {
    let gas_price = tx
        .effective_gas_price
        .or_else(|| ConsensusTransaction::gas_price(&tx))
        .unwrap_or_else(|| ConsensusTransaction::max_fee_per_gas(&tx));

    LedgerTransaction {
        hash: *tx.inner.inner().tx_hash(),
        from: tx.inner.signer(),
        to: ConsensusTransaction::to(&tx),
        nonce: ConsensusTransaction::nonce(&tx),
        value: ConsensusTransaction::value(&tx),
        gas_price,
        input: ConsensusTransaction::input(&tx).clone(),
        block_hash: tx.block_hash,
        block_number: tx.block_number,
    }
}

fn to_ledger_receipt(receipt: TransactionReceipt) -> LedgerReceipt {
    LedgerReceipt {
        hash: receipt.transaction_hash,
        from: receipt.from,
        status: receipt.status(),
        gas_used: receipt.gas_used,
        block_number: receipt.block_number,
        logs: receipt.inner.logs().iter().filter_map(to_observed_log).collect(),
    }
}

fn to_observed_log(log: &Log) -> Option<ObservedLog> {
    Some(ObservedLog {
        tx_hash: log.transaction_hash?,
        contract: log.address(),
        data: log.data().data.clone(),
        topics: log.topics().to_vec(),
        block_number: log.block_number?,
    })
}
