//! Contract log watcher.
//!
//! # Responsibilities
//! - Subscribe to one contract and one event signature, starting at the checkpoint
//! - Backfill logs between the checkpoint and the head after every (re)subscription
//! - Advance the checkpoint monotonically as logs arrive, in any order
//! - Resubscribe from the checkpoint when the stream is disposed while still listening
//!
//! Delivery is at-least-once: a log can arrive both from the backfill and the live
//! stream, so handlers must be idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::blockchain::client::ConnectionManager;
use crate::blockchain::session::{LogFilter, LogStream};
use crate::blockchain::types::{LedgerError, LedgerResult, ObservedLog};
use crate::events::bus::{LedgerEvent, NotificationBus};
use crate::events::checkpoint::CheckpointStore;
use crate::observability::metrics;
use crate::resilience::backoff::FailureStreak;

/// Consumer of observed logs.
#[async_trait]
pub trait LogHandler: Send + Sync {
    async fn on_log_event(&self, log: &ObservedLog);
}

/// A cancellable live subscription. `disposed` flips once its stream task has ended.
pub struct LogSubscription {
    cancel: Option<oneshot::Sender<()>>,
    disposed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl LogSubscription {
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn dispose(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.disposed.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

pub struct EventWatcher {
    connection: Arc<ConnectionManager>,
    checkpoints: Arc<dyn CheckpointStore>,
    bus: Arc<dyn NotificationBus>,
    handler: RwLock<Option<Weak<dyn LogHandler>>>,
    filter: LogFilter,
    network_id: u64,
    subscription: Mutex<Option<LogSubscription>>,
    failures: FailureStreak,
    retry_after: Mutex<Option<Instant>>,
}

impl EventWatcher {
    pub fn new(
        connection: Arc<ConnectionManager>,
        checkpoints: Arc<dyn CheckpointStore>,
        bus: Arc<dyn NotificationBus>,
        filter: LogFilter,
    ) -> Self {
        let network_id = connection.config().network_id;
        Self {
            connection,
            checkpoints,
            bus,
            handler: RwLock::new(None),
            filter,
            network_id,
            subscription: Mutex::new(None),
            failures: FailureStreak::new(1_000, 60_000),
            retry_after: Mutex::new(None),
        }
    }

    pub fn set_handler(&self, handler: Weak<dyn LogHandler>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(handler);
        }
    }

    fn handler(&self) -> Option<Arc<dyn LogHandler>> {
        self.handler
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(Weak::upgrade))
    }

    pub fn has_live_subscription(&self) -> bool {
        self.subscription
            .lock()
            .map(|slot| slot.as_ref().map(|s| !s.is_disposed()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Start watching from `from_block`, or from the checkpoint (initialized to the head).
    pub async fn start_watching(self: &Arc<Self>, from_block: Option<u64>) -> LedgerResult<()> {
        self.connection.set_listening(true);
        if self.has_live_subscription() {
            return Ok(());
        }

        let start = match from_block {
            Some(block) => block,
            None => self.checkpoint_or_head().await?,
        };

        tracing::info!(
            contract = %self.filter.address,
            from_block = start,
            "Starting to watch contract logs"
        );
        self.subscribe_from(start).await
    }

    async fn checkpoint_or_head(&self) -> LedgerResult<u64> {
        if let Some(block) = self.checkpoints.load(self.network_id).await? {
            return Ok(block);
        }
        if !self.connection.connect(false).await {
            return Err(LedgerError::Connection("cannot read head block".to_string()));
        }
        let head = self.connection.block_number().await?;
        self.checkpoints.advance(self.network_id, head).await
    }

    pub fn stop_watching(&self) {
        self.connection.set_listening(false);
        let previous = self.subscription.lock().ok().and_then(|mut slot| slot.take());
        if let Some(subscription) = previous {
            subscription.dispose();
            tracing::info!(contract = %self.filter.address, "Stopped watching contract logs");
        }
    }

    async fn subscribe_from(self: &Arc<Self>, start: u64) -> LedgerResult<()> {
        if !self.connection.begin_subscription() {
            tracing::debug!("Subscription already in progress");
            return Ok(());
        }
        let result = self.open_subscription(start).await;
        self.connection.end_subscription();
        result
    }

    async fn open_subscription(self: &Arc<Self>, start: u64) -> LedgerResult<()> {
        if !self.connection.connect(false).await {
            return Err(LedgerError::Connection("no ledger session to subscribe on".to_string()));
        }

        // Live stream first so nothing falls between the backfill and the subscription.
        let stream = self.connection.subscribe_logs(self.filter).await?;
        let head = self.connection.block_number().await?;
        let backlog = if head >= start {
            self.connection.logs(self.filter.starting_at(start), head).await?
        } else {
            Vec::new()
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let disposed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(Arc::clone(self).pump(stream, cancel_rx, disposed.clone()));
        let subscription = LogSubscription {
            cancel: Some(cancel_tx),
            disposed,
            task,
        };

        let previous = match self.subscription.lock() {
            Ok(mut slot) => slot.replace(subscription),
            Err(_) => {
                subscription.dispose();
                return Err(LedgerError::Connection("subscription slot poisoned".to_string()));
            }
        };
        if let Some(previous) = previous {
            previous.dispose();
        }

        tracing::info!(from_block = start, head = head, backlog = backlog.len(), "Log subscription open");
        for log in backlog {
            self.on_log(log).await;
        }
        Ok(())
    }

    async fn pump(
        self: Arc<Self>,
        mut stream: LogStream,
        mut cancel: oneshot::Receiver<()>,
        disposed: Arc<AtomicBool>,
    ) {
        loop {
            tokio::select! {
                _ = &mut cancel => break,
                next = stream.next() => match next {
                    Some(log) => self.on_log(log).await,
                    None => {
                        tracing::warn!("Log subscription stream ended");
                        break;
                    }
                }
            }
        }
        disposed.store(true, Ordering::SeqCst);
    }

    /// Advance the checkpoint, broadcast, and hand the log to the handler.
    pub async fn on_log(&self, log: ObservedLog) {
        metrics::record_log_observed();
        if let Err(e) = self.checkpoints.advance(self.network_id, log.block_number).await {
            tracing::warn!(block = log.block_number, error = %e, "Checkpoint update failed");
        }

        tracing::debug!(tx_hash = %log.tx_hash, block = log.block_number, "Contract log observed");
        self.bus.publish(LedgerEvent::ContractLogObserved(log.clone()));

        if let Some(handler) = self.handler() {
            handler.on_log_event(&log).await;
        }
    }

    /// Resubscribe from the checkpoint if listening and the stream is gone.
    pub async fn check_subscription(self: &Arc<Self>) {
        if !self.connection.is_listening() || self.connection.is_subscription_in_progress() {
            return;
        }
        if self.has_live_subscription() {
            return;
        }
        let held_off = self
            .retry_after
            .lock()
            .map(|until| matches!(*until, Some(at) if Instant::now() < at))
            .unwrap_or(false);
        if held_off {
            return;
        }

        let result = match self.checkpoint_or_head().await {
            Ok(start) => {
                tracing::info!(from_block = start, "Log subscription disposed, resubscribing");
                self.subscribe_from(start).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.failures.reset();
                if let Ok(mut until) = self.retry_after.lock() {
                    *until = None;
                }
            }
            Err(e) => {
                let delay = self.failures.record_failure();
                tracing::warn!(
                    failures = self.failures.failures(),
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Resubscription failed"
                );
                if let Ok(mut until) = self.retry_after.lock() {
                    *until = Some(Instant::now() + delay);
                }
            }
        }
    }

    pub async fn run_liveness(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_secs(self.connection.config().subscription_check_interval_secs);
        tracing::info!(interval_secs = interval.as_secs(), "Subscription liveness check starting");

        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_subscription().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Subscription liveness check received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
