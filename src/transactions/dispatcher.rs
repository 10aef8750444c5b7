//! Transaction dispatcher.
//!
//! # Responsibilities
//! - Count the attempt and stamp the send time, persist, then broadcast the raw payload
//! - Revert the attempt after a network failure so retries are not penalized
//! - Keep a rejected transaction pending when the ledger already knows it
//! - Sweep the send queue, one submission per sender per sweep, respecting the
//!   per-sender pending limit (boosts bypass it)
//!
//! # Data Flow
//! ```text
//! signed record ──▶ mark_sending ──▶ store.save ──▶ connection.send_raw
//!                                                      │
//!        accepted: Pending ◀───────────────────────────┤
//!        network error: attempt reverted, re-queued ◀──┤
//!        rejected: known → Pending, else re-queued ◀───┘
//!                                 │
//!                                 ▼
//!                   bus: TransactionSubmitted
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::blockchain::client::ConnectionManager;
use crate::blockchain::types::{LedgerError, LedgerResult};
use crate::config::schema::TransactionConfig;
use crate::events::bus::{LedgerEvent, NotificationBus};
use crate::observability::metrics;
use crate::transactions::record::{TransactionRecord, TransactionState};
use crate::transactions::store::TransactionStore;

pub struct Dispatcher {
    connection: Arc<ConnectionManager>,
    store: Arc<dyn TransactionStore>,
    bus: Arc<dyn NotificationBus>,
    config: TransactionConfig,
    network_id: u64,
}

impl Dispatcher {
    pub fn new(
        connection: Arc<ConnectionManager>,
        store: Arc<dyn TransactionStore>,
        bus: Arc<dyn NotificationBus>,
        config: TransactionConfig,
        network_id: u64,
    ) -> Self {
        Self {
            connection,
            store,
            bus,
            config,
            network_id,
        }
    }

    /// Submit in the background. The handle resolves to the updated record, or the
    /// submission error once the record has been updated accordingly.
    pub fn submit(self: &Arc<Self>, record: TransactionRecord) -> JoinHandle<LedgerResult<TransactionRecord>> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.submit_now(record).await })
    }

    pub async fn submit_now(&self, mut record: TransactionRecord) -> LedgerResult<TransactionRecord> {
        let raw = record.raw_transaction.clone().ok_or_else(|| {
            LedgerError::InvalidRequest(format!("record {} has no signed payload", record.id))
        })?;

        record.mark_sending();
        self.store.save(&record, false).await?;

        let outcome = match self.connection.send_raw(raw).await {
            Ok(hash) => {
                if record.hash != Some(hash) {
                    tracing::warn!(
                        local_hash = ?record.hash,
                        ledger_hash = %hash,
                        "Ledger returned a different hash, updating record"
                    );
                    record.hash = Some(hash);
                }
                record.mark_pending();
                metrics::record_submission("accepted");
                tracing::info!(
                    tx_hash = %hash,
                    nonce = record.nonce,
                    attempt = record.sending_attempt_count,
                    "Transaction submitted"
                );
                Ok(())
            }
            Err(LedgerError::SubmissionRejected(reason)) => {
                if self.known_to_ledger(&record).await {
                    record.mark_pending();
                    metrics::record_submission("already_known");
                    tracing::info!(tx_hash = ?record.hash, reason = %reason, "Rejected transaction is already known to the ledger");
                    Ok(())
                } else {
                    record.requeue();
                    metrics::record_submission("rejected");
                    tracing::warn!(
                        tx_hash = ?record.hash,
                        attempt = record.sending_attempt_count,
                        reason = %reason,
                        "Transaction rejected by ledger"
                    );
                    Err(LedgerError::SubmissionRejected(reason))
                }
            }
            Err(e) => {
                record.revert_sending();
                metrics::record_submission("network_error");
                tracing::warn!(tx_hash = ?record.hash, error = %e, "Transaction not delivered, attempt not counted");
                Err(e)
            }
        };

        self.store.save(&record, false).await?;
        if let Some(hash) = record.hash {
            self.bus.publish(LedgerEvent::TransactionSubmitted {
                hash,
                accepted: outcome.is_ok(),
            });
        }

        outcome.map(|()| record)
    }

    async fn known_to_ledger(&self, record: &TransactionRecord) -> bool {
        let Some(hash) = record.hash else {
            return false;
        };
        self.connection.invalidate(&hash);
        matches!(self.connection.transaction(hash).await, Ok(Some(_)))
    }

    /// Send queued records. Returns how many were accepted.
    pub async fn send_queued(&self) -> LedgerResult<usize> {
        let queued = self.store.queued_for_sending(self.network_id).await?;
        let mut senders_served = HashSet::new();
        let mut accepted = 0;

        for mut record in queued {
            if record.sending_attempt_count > self.config.max_sending_attempts {
                tracing::warn!(
                    tx_hash = ?record.hash,
                    attempts = record.sending_attempt_count,
                    "Sending attempts exhausted, marking transaction as failed"
                );
                let hash = record.hash;
                record.mark_failed(TransactionState::TimedOut);
                self.store.save(&record, true).await?;
                metrics::record_transition(TransactionState::TimedOut.as_str());
                self.bus.publish(LedgerEvent::TransactionTimedOut { hash });
                continue;
            }

            if !record.boost {
                if senders_served.contains(&record.from) {
                    continue;
                }
                let in_flight = self.store.count_pending_sent(record.from).await?;
                if in_flight >= self.config.max_pending_per_sender {
                    tracing::debug!(sender = %record.from, in_flight = in_flight, "Sender at pending limit");
                    continue;
                }
            }
            senders_served.insert(record.from);

            match self.submit_now(record).await {
                Ok(_) => accepted += 1,
                Err(e) => tracing::debug!(error = %e, "Queued transaction not accepted"),
            }
        }

        Ok(accepted)
    }
}
