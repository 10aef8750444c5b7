//! Fire-and-forget notification bus.

use alloy::primitives::TxHash;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::blockchain::types::ObservedLog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LedgerEvent {
    /// Emitted after every submission attempt, accepted or not.
    TransactionSubmitted { hash: TxHash, accepted: bool },
    TransactionMined {
        hash: TxHash,
        succeeded: bool,
        block_number: Option<u64>,
    },
    /// `nonce` is the value the record held before it was freed.
    TransactionSuperseded { hash: Option<TxHash>, nonce: u64 },
    TransactionTimedOut { hash: Option<TxHash> },
    TransactionBoosted { original: TxHash, successor: TxHash },
    ContractLogObserved(ObservedLog),
}

pub trait NotificationBus: Send + Sync {
    fn publish(&self, event: LedgerEvent);
}

/// In-process bus over a tokio broadcast channel. Events without subscribers are discarded.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<LedgerEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl NotificationBus for BroadcastBus {
    fn publish(&self, event: LedgerEvent) {
        tracing::trace!(event = ?event, "Publishing ledger event");
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ignored() {
        let bus = BroadcastBus::new(4);
        bus.publish(LedgerEvent::TransactionTimedOut { hash: None });

        let mut rx = bus.subscribe();
        let hash = TxHash::repeat_byte(1);
        bus.publish(LedgerEvent::TransactionSubmitted {
            hash,
            accepted: true,
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            LedgerEvent::TransactionSubmitted {
                hash,
                accepted: true
            }
        );
    }
}
