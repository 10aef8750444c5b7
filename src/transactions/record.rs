//! The transaction record tracked from signing to a terminal state.

use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::{Address, Bytes, TxHash, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blockchain::transaction::SignedTransaction;
use crate::blockchain::types::{LedgerReceipt, LedgerTransaction};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lifecycle position of a record.
///
/// `Created → Signed → Sent → Pending → {MinedSuccess, MinedFailure, TimedOut, Superseded}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Created,
    Signed,
    Sent,
    Pending,
    MinedSuccess,
    MinedFailure,
    TimedOut,
    Superseded,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionState::MinedSuccess
                | TransactionState::MinedFailure
                | TransactionState::TimedOut
                | TransactionState::Superseded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionState::Created => "created",
            TransactionState::Signed => "signed",
            TransactionState::Sent => "sent",
            TransactionState::Pending => "pending",
            TransactionState::MinedSuccess => "mined_success",
            TransactionState::MinedFailure => "mined_failure",
            TransactionState::TimedOut => "timed_out",
            TransactionState::Superseded => "superseded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub network_id: u64,
    /// Canonical hash; `None` until signed.
    pub hash: Option<TxHash>,
    pub from: Address,
    pub to: Option<Address>,
    /// 0 means unallocated.
    pub nonce: u64,
    /// Native value in wei.
    pub value: U256,
    /// Token amount in base units for contract calls.
    pub contract_amount: U256,
    pub contract_address: Option<Address>,
    pub method_name: Option<String>,
    pub gas_price: u128,
    pub gas_used: u64,
    pub pending: bool,
    pub succeeded: bool,
    pub sending_attempt_count: u32,
    /// Milliseconds since epoch of the last submission, cleared when re-queued.
    pub sent_timestamp: Option<u64>,
    pub created_timestamp: u64,
    pub boost: bool,
    pub dropped: bool,
    /// Present only for internally signed transactions.
    pub raw_transaction: Option<Bytes>,
    /// Hash of the record this boost replaces.
    pub replaces: Option<TxHash>,
    pub block_number: Option<u64>,
    pub state: TransactionState,
    /// Caller supplied context (e.g. a reward batch reference).
    pub label: Option<String>,
}

impl TransactionRecord {
    pub fn new(network_id: u64, from: Address) -> Self {
        Self {
            id: Uuid::new_v4(),
            network_id,
            hash: None,
            from,
            to: None,
            nonce: 0,
            value: U256::ZERO,
            contract_amount: U256::ZERO,
            contract_address: None,
            method_name: None,
            gas_price: 0,
            gas_used: 0,
            pending: false,
            succeeded: false,
            sending_attempt_count: 0,
            sent_timestamp: None,
            created_timestamp: now_millis(),
            boost: false,
            dropped: false,
            raw_transaction: None,
            replaces: None,
            block_number: None,
            state: TransactionState::Created,
            label: None,
        }
    }

    /// Record built from a transaction first seen on the ledger.
    pub fn observed(network_id: u64, tx: &LedgerTransaction) -> Self {
        let mut record = Self::new(network_id, tx.from);
        record.hash = Some(tx.hash);
        record.to = tx.to;
        record.nonce = tx.nonce;
        record.value = tx.value;
        record.gas_price = tx.gas_price;
        record.pending = true;
        record.state = TransactionState::Pending;
        record
    }

    /// Attach the signed payload. The record becomes pending and queued for sending.
    pub fn mark_signed(&mut self, signed: &SignedTransaction) {
        self.hash = Some(signed.hash);
        self.raw_transaction = Some(signed.raw.clone());
        self.pending = true;
        self.succeeded = false;
        self.state = TransactionState::Signed;
    }

    /// Count an attempt and stamp the send time.
    pub fn mark_sending(&mut self) {
        self.sending_attempt_count += 1;
        self.sent_timestamp = Some(now_millis());
        self.state = TransactionState::Sent;
    }

    /// Undo [`TransactionRecord::mark_sending`] after a network failure.
    pub fn revert_sending(&mut self) {
        self.sending_attempt_count = self.sending_attempt_count.saturating_sub(1);
        self.sent_timestamp = None;
        self.state = TransactionState::Signed;
    }

    /// Put the record back into the send queue without touching the attempt count.
    pub fn requeue(&mut self) {
        self.sent_timestamp = None;
        self.state = TransactionState::Signed;
    }

    /// Waiting to be mined.
    pub fn mark_pending(&mut self) {
        self.pending = true;
        self.state = TransactionState::Pending;
    }

    /// Whether `nonce` is taken on the sender's sequence. 0 is also the unallocated
    /// marker, so it only counts for a signed pending record or a mined one.
    pub fn holds_nonce(&self) -> bool {
        self.nonce > 0
            || (self.pending && self.raw_transaction.is_some())
            || matches!(
                self.state,
                TransactionState::MinedSuccess | TransactionState::MinedFailure
            )
    }

    pub fn is_queued(&self) -> bool {
        self.pending && self.raw_transaction.is_some() && self.sent_timestamp.is_none()
    }

    /// Apply a mined transaction and its receipt. `to` is left to the caller, which
    /// knows whether the transaction was a contract call.
    pub fn apply_mined(&mut self, tx: &LedgerTransaction, receipt: &LedgerReceipt) {
        self.hash = Some(tx.hash);
        self.from = tx.from;
        self.nonce = tx.nonce;
        self.value = tx.value;
        self.gas_price = tx.gas_price;
        self.gas_used = receipt.gas_used;
        self.block_number = receipt.block_number.or(tx.block_number);
        self.succeeded = receipt.status;
        self.pending = false;
        self.dropped = false;
        self.state = if receipt.status {
            TransactionState::MinedSuccess
        } else {
            TransactionState::MinedFailure
        };
    }

    /// Terminal failure that frees the nonce.
    pub fn mark_failed(&mut self, state: TransactionState) {
        self.pending = false;
        self.succeeded = false;
        self.nonce = 0;
        self.state = state;
    }

    /// Predecessor of an accepted boost.
    pub fn mark_dropped(&mut self) {
        self.dropped = true;
        self.mark_failed(TransactionState::Superseded);
    }

    /// Milliseconds the record has been waiting, from the last send or creation.
    pub fn age_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.sent_timestamp.unwrap_or(self.created_timestamp))
    }

    /// Successor for a fee boost: same nonce and intent, fresh id, not yet signed.
    pub fn boost_successor(&self) -> Self {
        let mut successor = self.clone();
        successor.id = Uuid::new_v4();
        successor.hash = None;
        successor.raw_transaction = None;
        successor.boost = true;
        successor.dropped = false;
        successor.sending_attempt_count = 0;
        successor.sent_timestamp = None;
        successor.created_timestamp = now_millis();
        successor.replaces = self.hash;
        successor.pending = false;
        successor.state = TransactionState::Created;
        successor
    }
}
