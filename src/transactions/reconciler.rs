//! Pending transaction reconciler.
//!
//! # Responsibilities
//! - Compare every pending record with the ledger and move it to a terminal state
//! - Apply the timeout policy (age in days, sending attempts) and detect nonces the
//!   ledger has moved past
//! - Boost records stuck below the current gas price
//! - Keep the log watcher running only while there is something to watch
//!
//! Reconciling an unchanged ledger twice produces no further writes or events.
//!
//! # Data Flow
//! ```text
//!                     ┌────────── mined ──────────▶ MinedSuccess / MinedFailure
//!  pending record ────┤                               │ (checkpoint, siblings superseded,
//!                     │                               │  lower nonces refreshed)
//!                     ├── unknown / not mined ──┬── nonce passed ──▶ Superseded
//!                     │                         ├── too old, resendable ──▶ re-queued
//!                     │                         └── too old ──▶ TimedOut
//!                     └── stuck, cheap ─────────▶ boost successor (same nonce)
//! ```

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, TxHash, U256};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time;

use crate::blockchain::client::ConnectionManager;
use crate::blockchain::contract::decode_log;
use crate::blockchain::session::NonceTag;
use crate::blockchain::transaction::{GasPolicy, TransferPayload};
use crate::blockchain::types::{LedgerReceipt, LedgerResult, LedgerTransaction, ObservedLog};
use crate::blockchain::wallet::SigningAuthority;
use crate::config::schema::{LedgerConfig, TransactionConfig};
use crate::events::bus::{LedgerEvent, NotificationBus};
use crate::events::checkpoint::CheckpointStore;
use crate::events::watcher::{EventWatcher, LogHandler};
use crate::observability::metrics;
use crate::transactions::dispatcher::Dispatcher;
use crate::transactions::record::{now_millis, TransactionRecord, TransactionState};
use crate::transactions::store::TransactionStore;

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Transitions made by one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub mined: usize,
    pub superseded: usize,
    pub timed_out: usize,
    pub requeued: usize,
    pub boosted: usize,
}

impl SweepReport {
    pub fn transitions(&self) -> usize {
        self.mined + self.superseded + self.timed_out + self.requeued + self.boosted
    }
}

pub struct Reconciler {
    connection: Arc<ConnectionManager>,
    store: Arc<dyn TransactionStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    bus: Arc<dyn NotificationBus>,
    dispatcher: Arc<Dispatcher>,
    authority: Arc<SigningAuthority>,
    watcher: Arc<EventWatcher>,
    gas_policy: GasPolicy,
    contract: Address,
    network_id: u64,
    polling_interval: Duration,
    permanently_watch: bool,
    record_observed: bool,
    config: TransactionConfig,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection: Arc<ConnectionManager>,
        store: Arc<dyn TransactionStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        bus: Arc<dyn NotificationBus>,
        dispatcher: Arc<Dispatcher>,
        authority: Arc<SigningAuthority>,
        watcher: Arc<EventWatcher>,
        ledger: &LedgerConfig,
        config: TransactionConfig,
    ) -> Self {
        Self {
            connection,
            store,
            checkpoints,
            bus,
            dispatcher,
            authority,
            watcher,
            gas_policy: GasPolicy::from_config(ledger),
            contract: ledger.contract_address.parse().unwrap_or(Address::ZERO),
            network_id: ledger.network_id,
            polling_interval: Duration::from_secs(ledger.polling_interval_secs),
            permanently_watch: ledger.permanently_watch,
            record_observed: ledger.record_observed_transactions,
            config,
        }
    }

    /// Reconcile every pending record, then boost the stuck ones.
    pub async fn sweep(&self) -> LedgerResult<SweepReport> {
        let mut report = SweepReport::default();
        let pending = self.store.pending_transactions(self.network_id).await?;
        metrics::record_pending_transactions(pending.len());
        self.adjust_watching(!pending.is_empty()).await;

        if pending.is_empty() {
            return Ok(report);
        }
        if !self.connection.connect(true).await {
            tracing::debug!(pending = pending.len(), "Ledger unavailable, skipping reconciliation");
            return Ok(report);
        }

        for record in pending {
            // An earlier record in this sweep may already have moved this one.
            let Some(current) = self.store.get(&record.id).await? else {
                continue;
            };
            if !current.pending {
                continue;
            }
            report.checked += 1;
            if let Err(e) = self.reconcile_cascading(current, &mut report).await {
                tracing::warn!(tx_hash = ?record.hash, error = %e, "Reconciliation failed");
            }
        }

        if self.config.boost_enabled {
            if let Err(e) = self.boost_stuck(&mut report).await {
                tracing::warn!(error = %e, "Boost pass failed");
            }
        }

        if report.transitions() > 0 {
            tracing::info!(
                checked = report.checked,
                mined = report.mined,
                superseded = report.superseded,
                timed_out = report.timed_out,
                requeued = report.requeued,
                boosted = report.boosted,
                "Reconciliation sweep complete"
            );
        }
        Ok(report)
    }

    async fn adjust_watching(&self, has_pending: bool) {
        if self.contract == Address::ZERO {
            return;
        }
        if self.permanently_watch || has_pending {
            if !self.connection.is_listening() {
                if let Err(e) = self.watcher.start_watching(None).await {
                    tracing::warn!(error = %e, "Cannot start watching contract logs");
                }
            }
        } else if self.connection.is_listening() {
            self.watcher.stop_watching();
        }
    }

    /// Re-read one record from the ledger, bypassing the cache.
    pub async fn refresh_from_ledger(&self, hash: TxHash) -> LedgerResult<Option<TransactionRecord>> {
        let Some(record) = self.store.get_by_hash(&hash).await? else {
            return Ok(None);
        };
        self.connection.invalidate(&hash);
        let updated = self
            .reconcile_cascading(record, &mut SweepReport::default())
            .await?;
        Ok(Some(updated))
    }

    /// Reconcile one record; if it was mined, refresh the sender's lower nonces too.
    async fn reconcile_cascading(
        &self,
        record: TransactionRecord,
        report: &mut SweepReport,
    ) -> LedgerResult<TransactionRecord> {
        let before = record.state;
        let updated = self.reconcile(record, report).await?;
        if before != updated.state && updated.state.is_terminal() && updated.block_number.is_some() {
            let lower: Vec<_> = self
                .store
                .pending_for_sender(updated.from)
                .await?
                .into_iter()
                .filter(|r| r.id != updated.id && r.nonce < updated.nonce)
                .collect();
            for record in lower {
                if let Err(e) = self.reconcile(record, report).await {
                    tracing::debug!(error = %e, "Lower nonce refresh failed");
                }
            }
        }
        Ok(updated)
    }

    async fn reconcile(
        &self,
        record: TransactionRecord,
        report: &mut SweepReport,
    ) -> LedgerResult<TransactionRecord> {
        let Some(hash) = record.hash else {
            return Ok(record);
        };

        let found = self.connection.transaction(hash).await?;
        if let Some(tx) = found.as_ref().filter(|tx| tx.is_mined()) {
            return match self.connection.receipt(hash).await? {
                Some(receipt) => self.apply_mined(record, tx, &receipt, report).await,
                None => Ok(record),
            };
        }

        if !record.pending {
            return Ok(record);
        }
        if record.boost && self.predecessor_mined(&record, report).await? {
            return Ok(self.store.get(&record.id).await?.unwrap_or(record));
        }
        if record.boost && record.state == TransactionState::Pending {
            self.retire_predecessor(&record, report).await?;
        }
        self.check_validity(record, found.is_some(), report).await
    }

    async fn apply_mined(
        &self,
        record: TransactionRecord,
        tx: &LedgerTransaction,
        receipt: &LedgerReceipt,
        report: &mut SweepReport,
    ) -> LedgerResult<TransactionRecord> {
        let mut updated = record.clone();
        updated.apply_mined(tx, receipt);
        self.apply_call_details(&mut updated, tx, receipt);
        if updated == record {
            return Ok(record);
        }

        self.store.save(&updated, true).await?;
        metrics::record_transition(updated.state.as_str());
        report.mined += 1;
        tracing::info!(
            tx_hash = %tx.hash,
            nonce = updated.nonce,
            block = ?updated.block_number,
            succeeded = updated.succeeded,
            "Transaction mined"
        );

        if record.pending {
            if let Some(block) = updated.block_number {
                self.checkpoints.advance(self.network_id, block).await?;
            }
        }
        self.supersede_siblings(&updated, report).await?;
        Ok(updated)
    }

    /// Contract calls get method, amount and counterparty from the receipt logs.
    fn apply_call_details(
        &self,
        record: &mut TransactionRecord,
        tx: &LedgerTransaction,
        receipt: &LedgerReceipt,
    ) {
        if tx.to != Some(self.contract) || self.contract == Address::ZERO {
            record.contract_address = None;
            record.method_name = None;
            record.contract_amount = U256::ZERO;
            record.to = tx.to;
            return;
        }

        record.contract_address = Some(self.contract);
        let event = receipt
            .logs
            .iter()
            .filter(|log| log.contract == self.contract)
            .find_map(decode_log);
        match event {
            Some(event) => {
                record.method_name = Some(event.method_name(tx.from).to_string());
                record.contract_amount = event.amount();
                record.to = Some(event.counterparty());
            }
            None if record.to.is_none() => record.to = tx.to,
            None => {}
        }
    }

    /// Other pending records holding the mined (sender, nonce) can never be mined.
    async fn supersede_siblings(
        &self,
        mined: &TransactionRecord,
        report: &mut SweepReport,
    ) -> LedgerResult<()> {
        let siblings = self.store.records_with_nonce(mined.from, mined.nonce).await?;
        for mut sibling in siblings {
            if sibling.id == mined.id || !sibling.pending {
                continue;
            }
            let hash = sibling.hash;
            sibling.mark_failed(TransactionState::Superseded);
            self.store.save(&sibling, true).await?;
            metrics::record_transition(TransactionState::Superseded.as_str());
            report.superseded += 1;
            tracing::info!(tx_hash = ?hash, nonce = mined.nonce, "Transaction superseded by a mined sibling");
            self.bus.publish(LedgerEvent::TransactionSuperseded {
                hash,
                nonce: mined.nonce,
            });
        }
        Ok(())
    }

    /// A boost successor whose dropped predecessor got mined after all.
    async fn predecessor_mined(
        &self,
        successor: &TransactionRecord,
        report: &mut SweepReport,
    ) -> LedgerResult<bool> {
        let Some(original_hash) = successor.replaces else {
            return Ok(false);
        };
        let Some(tx) = self.connection.transaction(original_hash).await? else {
            return Ok(false);
        };
        if !tx.is_mined() {
            return Ok(false);
        }
        let (Some(original), Some(receipt)) = (
            self.store.get_by_hash(&original_hash).await?,
            self.connection.receipt(original_hash).await?,
        ) else {
            return Ok(false);
        };

        tracing::info!(
            original = %original_hash,
            successor = ?successor.hash,
            "Dropped transaction was mined, superseding its boost"
        );
        self.apply_mined(original, &tx, &receipt, report).await?;
        Ok(true)
    }

    /// A successor delivered by the send queue after its boost failed in transit
    /// replaces the predecessor only now.
    async fn retire_predecessor(
        &self,
        successor: &TransactionRecord,
        report: &mut SweepReport,
    ) -> LedgerResult<()> {
        let Some(original_hash) = successor.replaces else {
            return Ok(());
        };
        match self.store.get_by_hash(&original_hash).await? {
            Some(original) if original.pending && !original.dropped => {
                self.drop_predecessor(original, successor.hash, report).await
            }
            _ => Ok(()),
        }
    }

    async fn drop_predecessor(
        &self,
        mut original: TransactionRecord,
        successor: Option<TxHash>,
        report: &mut SweepReport,
    ) -> LedgerResult<()> {
        let original_hash = original.hash;
        let nonce = original.nonce;
        original.mark_dropped();
        self.store.save(&original, true).await?;
        metrics::record_transition(TransactionState::Superseded.as_str());
        report.boosted += 1;

        if let (Some(original), Some(successor)) = (original_hash, successor) {
            self.bus.publish(LedgerEvent::TransactionBoosted { original, successor });
        }
        self.bus.publish(LedgerEvent::TransactionSuperseded {
            hash: original_hash,
            nonce,
        });
        Ok(())
    }

    async fn check_validity(
        &self,
        mut record: TransactionRecord,
        known: bool,
        report: &mut SweepReport,
    ) -> LedgerResult<TransactionRecord> {
        let max_days = self.config.pending_max_days;
        let too_old = max_days > 0 && record.age_millis(now_millis()) / MILLIS_PER_DAY >= max_days;
        let attempts_exhausted = record.sending_attempt_count > self.config.max_sending_attempts;
        if !too_old && !attempts_exhausted {
            return Ok(record);
        }

        let hash = record.hash;
        let latest = self
            .connection
            .transaction_count(record.from, NonceTag::Latest)
            .await?;
        if latest > record.nonce + 1 {
            tracing::info!(
                tx_hash = ?hash,
                nonce = record.nonce,
                ledger_nonce = latest,
                "Ledger nonce moved past transaction, marking superseded"
            );
            let nonce = record.nonce;
            record.mark_failed(TransactionState::Superseded);
            self.store.save(&record, true).await?;
            metrics::record_transition(TransactionState::Superseded.as_str());
            report.superseded += 1;
            self.bus.publish(LedgerEvent::TransactionSuperseded { hash, nonce });
            return Ok(record);
        }

        if known {
            return Ok(record);
        }

        let resendable = record.raw_transaction.is_some() && !attempts_exhausted;
        if resendable {
            if record.sent_timestamp.is_some() {
                tracing::info!(
                    tx_hash = ?hash,
                    attempts = record.sending_attempt_count,
                    "Transaction unknown to the ledger, re-queueing"
                );
                record.requeue();
                self.store.save(&record, false).await?;
                report.requeued += 1;
            }
            return Ok(record);
        }

        tracing::warn!(
            tx_hash = ?hash,
            attempts = record.sending_attempt_count,
            "Transaction timed out"
        );
        record.mark_failed(TransactionState::TimedOut);
        self.store.save(&record, true).await?;
        metrics::record_transition(TransactionState::TimedOut.as_str());
        report.timed_out += 1;
        self.bus.publish(LedgerEvent::TransactionTimedOut { hash });
        Ok(record)
    }

    fn is_boost_candidate(&self, record: &TransactionRecord, now: u64) -> bool {
        let boost_after = self.config.boost_after_secs * 1000;
        record.pending
            && !record.boost
            && !record.dropped
            && record.raw_transaction.is_some()
            && record
                .sent_timestamp
                .map(|sent| now.saturating_sub(sent) >= boost_after)
                .unwrap_or(false)
    }

    async fn boost_stuck(&self, report: &mut SweepReport) -> LedgerResult<()> {
        let now = now_millis();
        let candidates: Vec<_> = self
            .store
            .pending_transactions(self.network_id)
            .await?
            .into_iter()
            .filter(|r| self.is_boost_candidate(r, now))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let network_price = self.connection.gas_price().await?;
        for record in candidates {
            if network_price <= record.gas_price {
                continue;
            }
            // One successor per record, whatever became of it.
            if let Some(hash) = record.hash {
                if self.store.boost_of(&hash).await?.is_some() {
                    continue;
                }
            }
            if let Err(e) = self.boost(record, network_price, report).await {
                tracing::warn!(error = %e, "Boost failed");
            }
        }
        Ok(())
    }

    /// Re-sign `original` at the current price under the same nonce. The original is
    /// dropped only once the ledger accepts the successor.
    async fn boost(
        &self,
        original: TransactionRecord,
        network_price: u128,
        report: &mut SweepReport,
    ) -> LedgerResult<()> {
        let Some(raw) = original.raw_transaction.as_ref() else {
            return Ok(());
        };
        let payload = TransferPayload::from_raw(raw)?;
        let gas_price = self.gas_policy.apply(network_price)?;

        let mut successor = original.boost_successor();
        successor.gas_price = gas_price;
        let signed = self
            .authority
            .build_and_sign(&payload, original.nonce, gas_price)
            .await?;
        successor.mark_signed(&signed);
        self.store.save(&successor, false).await?;

        tracing::info!(
            original = ?original.hash,
            successor = %signed.hash,
            nonce = original.nonce,
            old_gas_price = original.gas_price,
            new_gas_price = gas_price,
            "Boosting stuck transaction"
        );

        match self.dispatcher.submit_now(successor.clone()).await {
            Ok(accepted) => self.drop_predecessor(original, accepted.hash, report).await,
            Err(e) if e.is_transient() => {
                // The node may have received it: keep it queued under the same nonce.
                tracing::warn!(
                    original = ?original.hash,
                    successor = %signed.hash,
                    error = %e,
                    "Boost not delivered, successor stays queued"
                );
                Err(e)
            }
            Err(e) => {
                let mut failed = self.store.get(&successor.id).await?.unwrap_or(successor);
                failed.mark_failed(TransactionState::Superseded);
                self.store.save(&failed, false).await?;
                tracing::warn!(
                    original = ?original.hash,
                    error = %e,
                    "Boost not accepted, original stays pending"
                );
                Err(e)
            }
        }
    }

    /// Record a contract transaction seen only through its logs.
    async fn record_observed(&self, hash: TxHash) -> LedgerResult<()> {
        let Some(tx) = self.connection.transaction(hash).await? else {
            return Ok(());
        };
        if !tx.is_mined() || tx.to != Some(self.contract) {
            return Ok(());
        }
        let Some(receipt) = self.connection.receipt(hash).await? else {
            return Ok(());
        };

        let record = TransactionRecord::observed(self.network_id, &tx);
        self.store.save(&record, false).await?;
        let mut report = SweepReport::default();
        self.apply_mined(record, &tx, &receipt, &mut report).await?;
        tracing::debug!(tx_hash = %hash, "Recorded externally sent contract transaction");
        Ok(())
    }

    async fn handle_log(&self, log: &ObservedLog) -> LedgerResult<()> {
        match self.store.get_by_hash(&log.tx_hash).await? {
            Some(record)
                if matches!(
                    record.state,
                    TransactionState::MinedSuccess | TransactionState::MinedFailure
                ) =>
            {
                Ok(())
            }
            Some(record) => {
                self.reconcile_cascading(record, &mut SweepReport::default())
                    .await?;
                Ok(())
            }
            None if self.record_observed => self.record_observed(log.tx_hash).await,
            None => Ok(()),
        }
    }

    /// Reconcile and dispatch on the polling interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval_secs = self.polling_interval.as_secs(),
            "Transaction reconciler starting"
        );

        let mut ticker = time::interval(self.polling_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::warn!(error = %e, "Reconciliation sweep failed");
                    }
                    if let Err(e) = self.dispatcher.send_queued().await {
                        tracing::warn!(error = %e, "Send queue sweep failed");
                    }
                    self.connection.evict_expired();
                }
                _ = shutdown.recv() => {
                    tracing::info!("Transaction reconciler received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl LogHandler for Reconciler {
    async fn on_log_event(&self, log: &ObservedLog) {
        if let Err(e) = self.handle_log(log).await {
            tracing::warn!(tx_hash = %log.tx_hash, error = %e, "Observed log not reconciled");
        }
    }
}
