//! In-process transaction store with JSON snapshot persistence.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::blockchain::types::LedgerResult;
use crate::events::bus::{LedgerEvent, NotificationBus};
use crate::transactions::record::{TransactionRecord, TransactionState};
use crate::transactions::store::TransactionStore;

/// A thread-safe store keyed by record id.
#[derive(Clone, Default)]
pub struct MemoryTransactionStore {
    inner: Arc<DashMap<Uuid, TransactionRecord>>,
    bus: Option<Arc<dyn NotificationBus>>,
    persistence_path: Option<String>,
}

impl MemoryTransactionStore {
    pub fn new(persistence_path: Option<String>) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            bus: None,
            persistence_path,
        }
    }

    /// Announce mined records on `bus` when saved with `broadcast_mined`.
    pub fn with_bus(mut self, bus: Arc<dyn NotificationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Load from file if exists.
    pub fn load_from_file(path: &str) -> std::io::Result<Self> {
        let store = Self::new(Some(path.to_string()));
        if Path::new(path).exists() {
            let reader = BufReader::new(File::open(path)?);
            let records: Vec<TransactionRecord> = serde_json::from_reader(reader)?;
            for record in records {
                store.inner.insert(record.id, record);
            }
            tracing::info!(records = store.inner.len(), path = %path, "Loaded transaction records");
        }
        Ok(store)
    }

    /// Save to file.
    pub fn save_to_file(&self) -> std::io::Result<()> {
        if let Some(path) = &self.persistence_path {
            let writer = BufWriter::new(File::create(path)?);
            let records = self.snapshot();
            serde_json::to_writer(writer, &records)?;
            tracing::info!(records = records.len(), path = %path, "Saved transaction records");
        }
        Ok(())
    }

    /// Every record, ordered by creation time.
    pub fn snapshot(&self) -> Vec<TransactionRecord> {
        let mut records: Vec<_> = self.inner.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| (r.created_timestamp, r.nonce));
        records
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn filtered<F>(&self, predicate: F) -> Vec<TransactionRecord>
    where
        F: Fn(&TransactionRecord) -> bool,
    {
        let mut records: Vec<_> = self
            .inner
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| (r.from, r.nonce, r.created_timestamp));
        records
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn get(&self, id: &Uuid) -> LedgerResult<Option<TransactionRecord>> {
        Ok(self.inner.get(id).map(|r| r.value().clone()))
    }

    async fn get_by_hash(&self, hash: &TxHash) -> LedgerResult<Option<TransactionRecord>> {
        Ok(self
            .inner
            .iter()
            .find(|r| r.value().hash.as_ref() == Some(hash))
            .map(|r| r.value().clone()))
    }

    async fn save(&self, record: &TransactionRecord, broadcast_mined: bool) -> LedgerResult<()> {
        self.inner.insert(record.id, record.clone());

        let mined = matches!(
            record.state,
            TransactionState::MinedSuccess | TransactionState::MinedFailure
        );
        if broadcast_mined && mined {
            if let (Some(bus), Some(hash)) = (&self.bus, record.hash) {
                bus.publish(LedgerEvent::TransactionMined {
                    hash,
                    succeeded: record.succeeded,
                    block_number: record.block_number,
                });
            }
        }
        Ok(())
    }

    async fn pending_transactions(&self, network_id: u64) -> LedgerResult<Vec<TransactionRecord>> {
        Ok(self.filtered(|r| r.pending && r.network_id == network_id))
    }

    async fn pending_for_sender(&self, sender: Address) -> LedgerResult<Vec<TransactionRecord>> {
        Ok(self.filtered(|r| r.pending && r.from == sender))
    }

    async fn queued_for_sending(&self, network_id: u64) -> LedgerResult<Vec<TransactionRecord>> {
        let mut records = self.filtered(|r| r.network_id == network_id && r.is_queued());
        records.sort_by_key(|r| (r.nonce, r.created_timestamp));
        Ok(records)
    }

    async fn highest_nonce(&self, sender: Address) -> LedgerResult<Option<u64>> {
        Ok(self
            .inner
            .iter()
            .filter(|r| r.value().from == sender && r.value().holds_nonce())
            .map(|r| r.value().nonce)
            .max())
    }

    async fn boost_of(&self, original: &TxHash) -> LedgerResult<Option<TransactionRecord>> {
        Ok(self
            .inner
            .iter()
            .find(|r| r.value().boost && r.value().replaces.as_ref() == Some(original))
            .map(|r| r.value().clone()))
    }

    async fn count_pending_sent(&self, sender: Address) -> LedgerResult<usize> {
        Ok(self
            .inner
            .iter()
            .filter(|r| {
                let r = r.value();
                r.from == sender
                    && r.pending
                    && r.raw_transaction.is_some()
                    && r.sent_timestamp.is_some()
            })
            .count())
    }

    async fn records_with_nonce(&self, sender: Address, nonce: u64) -> LedgerResult<Vec<TransactionRecord>> {
        Ok(self.filtered(|r| r.from == sender && r.nonce == nonce))
    }
}
