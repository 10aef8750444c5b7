//! Transaction store contract.
//!
//! The store owns durability of [`TransactionRecord`]s. Each `save` replaces one
//! record atomically; the keeper never deletes records.

use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;
use uuid::Uuid;

use crate::blockchain::types::LedgerResult;
use crate::transactions::record::TransactionRecord;

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn get(&self, id: &Uuid) -> LedgerResult<Option<TransactionRecord>>;

    async fn get_by_hash(&self, hash: &TxHash) -> LedgerResult<Option<TransactionRecord>>;

    /// Insert or replace. With `broadcast_mined`, a record in a mined state is announced on the bus.
    async fn save(&self, record: &TransactionRecord, broadcast_mined: bool) -> LedgerResult<()>;

    /// Every pending record of a network, ordered by sender then nonce.
    async fn pending_transactions(&self, network_id: u64) -> LedgerResult<Vec<TransactionRecord>>;

    async fn pending_for_sender(&self, sender: Address) -> LedgerResult<Vec<TransactionRecord>>;

    /// Signed, pending records never sent (or re-queued), ordered by nonce.
    async fn queued_for_sending(&self, network_id: u64) -> LedgerResult<Vec<TransactionRecord>>;

    /// Highest nonce `sender` holds, `None` when it holds none. Nonce 0 is held
    /// once signed, see [`TransactionRecord::holds_nonce`].
    async fn highest_nonce(&self, sender: Address) -> LedgerResult<Option<u64>>;

    /// The boost successor created for the record with hash `original`, in any state.
    async fn boost_of(&self, original: &TxHash) -> LedgerResult<Option<TransactionRecord>>;

    /// Self-signed records of `sender` that are submitted and still pending.
    async fn count_pending_sent(&self, sender: Address) -> LedgerResult<usize>;

    async fn records_with_nonce(&self, sender: Address, nonce: u64) -> LedgerResult<Vec<TransactionRecord>>;
}
