//! Nonce allocation for the administrative sender.
//!
//! The next nonce is `max(chain pending count, highest stored nonce + 1)`. The
//! chain count is refreshed at most once per interval. Each sender has its own
//! async lock; an allocation holds it through a [`NonceLease`] until the caller
//! has stored the record and committed, so the next allocation always sees the
//! previous one.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::blockchain::client::ConnectionManager;
use crate::blockchain::session::NonceTag;
use crate::blockchain::types::LedgerResult;
use crate::transactions::store::TransactionStore;

#[derive(Debug, Default)]
struct ChainNonce {
    value: u64,
    refreshed_at: Option<Instant>,
}

/// An allocated nonce. Dropping it without [`NonceLease::commit`] returns nothing to
/// the pool because nothing was taken: the next allocation recomputes from the store.
pub struct NonceLease {
    nonce: u64,
    guard: OwnedMutexGuard<ChainNonce>,
}

impl NonceLease {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Confirm the nonce is durably recorded and release the sender lock.
    pub fn commit(mut self) {
        self.guard.value = self.guard.value.max(self.nonce + 1);
    }
}

impl std::fmt::Debug for NonceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceLease").field("nonce", &self.nonce).finish()
    }
}

pub struct NonceAllocator {
    connection: Arc<ConnectionManager>,
    store: Arc<dyn TransactionStore>,
    refresh_interval: Duration,
    senders: DashMap<Address, Arc<Mutex<ChainNonce>>>,
}

impl NonceAllocator {
    pub fn new(
        connection: Arc<ConnectionManager>,
        store: Arc<dyn TransactionStore>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            connection,
            store,
            refresh_interval,
            senders: DashMap::new(),
        }
    }

    pub async fn allocate(&self, sender: Address) -> LedgerResult<NonceLease> {
        let slot = self
            .senders
            .entry(sender)
            .or_insert_with(|| Arc::new(Mutex::new(ChainNonce::default())))
            .clone();
        let mut guard = slot.lock_owned().await;

        let stale = guard
            .refreshed_at
            .map(|at| at.elapsed() >= self.refresh_interval)
            .unwrap_or(true);
        if stale {
            match self
                .connection
                .transaction_count(sender, NonceTag::Pending)
                .await
            {
                Ok(count) => {
                    guard.value = count;
                    guard.refreshed_at = Some(Instant::now());
                }
                Err(e) if guard.refreshed_at.is_some() => {
                    tracing::warn!(
                        sender = %sender,
                        cached = guard.value,
                        error = %e,
                        "Pending nonce refresh failed, using cached value"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let stored_floor = self
            .store
            .highest_nonce(sender)
            .await?
            .map(|highest| highest + 1)
            .unwrap_or(0);
        let nonce = guard.value.max(stored_floor);

        tracing::debug!(
            sender = %sender,
            chain = guard.value,
            stored_floor = stored_floor,
            nonce = nonce,
            "Nonce allocated"
        );
        Ok(NonceLease { nonce, guard })
    }

    /// Next nonce for `sender` without reserving it.
    pub async fn peek(&self, sender: Address) -> LedgerResult<u64> {
        Ok(self.allocate(sender).await?.nonce())
    }

    /// Force the next allocation to re-read the chain.
    pub async fn invalidate(&self, sender: Address) {
        let slot = self.senders.get(&sender).map(|slot| slot.value().clone());
        if let Some(slot) = slot {
            slot.lock().await.refreshed_at = None;
        }
    }
}
