//! Durable watch checkpoint: the last block processed per network.
//!
//! The stored value never decreases; `advance` with a lower block is a no-op.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::blockchain::types::LedgerResult;
use crate::observability::metrics;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, network_id: u64) -> LedgerResult<Option<u64>>;

    /// Raise the checkpoint to `block` if higher. Returns the stored value.
    async fn advance(&self, network_id: u64, block: u64) -> LedgerResult<u64>;
}

#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<DashMap<u64, u64>>,
    persistence_path: Option<String>,
}

impl MemoryCheckpointStore {
    pub fn new(persistence_path: Option<String>) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            persistence_path,
        }
    }

    /// Load from file if exists.
    pub fn load_from_file(path: &str) -> std::io::Result<Self> {
        let store = Self::new(Some(path.to_string()));
        if Path::new(path).exists() {
            let reader = BufReader::new(File::open(path)?);
            let map: HashMap<u64, u64> = serde_json::from_reader(reader)?;
            for (network_id, block) in map {
                store.inner.insert(network_id, block);
            }
            tracing::info!(networks = store.inner.len(), path = %path, "Loaded watch checkpoints");
        }
        Ok(store)
    }

    /// Save to file.
    pub fn save_to_file(&self) -> std::io::Result<()> {
        if let Some(path) = &self.persistence_path {
            let writer = BufWriter::new(File::create(path)?);
            let map: HashMap<u64, u64> = self.inner.iter().map(|r| (*r.key(), *r.value())).collect();
            serde_json::to_writer(writer, &map)?;
            tracing::info!(networks = map.len(), path = %path, "Saved watch checkpoints");
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, network_id: u64) -> LedgerResult<Option<u64>> {
        Ok(self.inner.get(&network_id).map(|r| *r.value()))
    }

    async fn advance(&self, network_id: u64, block: u64) -> LedgerResult<u64> {
        let stored = *self
            .inner
            .entry(network_id)
            .and_modify(|current| *current = (*current).max(block))
            .or_insert(block);
        metrics::record_checkpoint(stored);
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checkpoint_never_decreases() {
        let store = MemoryCheckpointStore::new(None);
        assert_eq!(store.load(1).await.unwrap(), None);

        for (block, expected) in [(10, 10), (7, 10), (12, 12), (11, 12), (12, 12)] {
            assert_eq!(store.advance(1, block).await.unwrap(), expected);
        }
        assert_eq!(store.load(1).await.unwrap(), Some(12));
        assert_eq!(store.load(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_advances_keep_maximum() {
        let store = MemoryCheckpointStore::new(None);
        let mut handles = Vec::new();
        for block in 1..=50u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.advance(1, block).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.load(1).await.unwrap(), Some(50));
    }
}
