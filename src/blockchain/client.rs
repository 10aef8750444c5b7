//! Connection manager owning the single session to the ledger node.
//!
//! # Responsibilities
//! - Open the session under a connect lock with bounded wait, verify the chain id
//! - Block callers in `ensure_connected` for a bounded number of fixed-interval retries
//! - Serve reads with per-call timeouts; transaction, receipt and balance reads
//!   go through single-flight caches
//! - Probe the session periodically and reconnect silently
//! - Hold the watcher flags (`listening`, `subscription_in_progress`) and the
//!   `stopping` flag checked by every reconnect
//!
//! # Data Flow
//! ```text
//! caller ──read──▶ SingleFlightCache ──miss──▶ session (timeout) ──▶ ledger node
//!                                                   │ transport gone
//!                                                   ▼
//!                               session dropped ◀── health loop reconnects
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, Bytes, TxHash, U256};
use arc_swap::ArcSwapOption;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{self, timeout};

use crate::blockchain::cache::SingleFlightCache;
use crate::blockchain::contract;
use crate::blockchain::session::{LedgerConnector, LedgerSession, LogFilter, LogStream, NonceTag};
use crate::blockchain::types::{
    LedgerConfig, LedgerError, LedgerReceipt, LedgerResult, LedgerTransaction, ObservedLog,
};
use crate::observability::metrics;

struct ActiveSession {
    inner: Arc<dyn LedgerSession>,
    opened_at: Instant,
}

pub struct ConnectionManager {
    config: LedgerConfig,
    connector: Arc<dyn LedgerConnector>,
    session: ArcSwapOption<ActiveSession>,
    connect_lock: Mutex<()>,
    stopping: AtomicBool,
    listening: AtomicBool,
    subscription_in_progress: AtomicBool,
    rpc_timeout: Duration,
    transactions: SingleFlightCache<TxHash, Option<LedgerTransaction>>,
    receipts: SingleFlightCache<TxHash, Option<LedgerReceipt>>,
    balances: SingleFlightCache<Address, U256>,
    token_balances: SingleFlightCache<(Address, Address), U256>,
}

impl ConnectionManager {
    pub fn new(config: LedgerConfig, connector: Arc<dyn LedgerConnector>) -> Self {
        let ttl = Duration::from_secs(config.cache_ttl_secs);
        Self {
            rpc_timeout: Duration::from_secs(config.rpc_timeout_secs),
            config,
            connector,
            session: ArcSwapOption::empty(),
            connect_lock: Mutex::new(()),
            stopping: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            subscription_in_progress: AtomicBool::new(false),
            transactions: SingleFlightCache::new("transaction", ttl),
            receipts: SingleFlightCache::new("receipt", ttl),
            balances: SingleFlightCache::new("balance", ttl),
            token_balances: SingleFlightCache::new("token_balance", ttl),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .load_full()
            .map(|active| active.inner.is_alive())
            .unwrap_or(false)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Allow connections again after [`ConnectionManager::close`].
    pub fn resume(&self) {
        self.stopping.store(false, Ordering::SeqCst);
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
    }

    /// Claim the subscription slot. Returns false when another task holds it.
    pub fn begin_subscription(&self) -> bool {
        self.subscription_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_subscription(&self) {
        self.subscription_in_progress.store(false, Ordering::SeqCst);
    }

    pub fn is_subscription_in_progress(&self) -> bool {
        self.subscription_in_progress.load(Ordering::SeqCst)
    }

    /// Open a session if none is alive. Never blocks longer than the lock wait plus RPC timeout.
    ///
    /// `periodic` marks calls from the health loop, whose failures are logged quietly.
    pub async fn connect(&self, periodic: bool) -> bool {
        if self.is_stopping() {
            return false;
        }
        if self.is_connected() {
            return true;
        }

        let lock_wait = Duration::from_millis(self.config.connect_lock_wait_ms);
        let _guard = match timeout(lock_wait, self.connect_lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!(wait_ms = self.config.connect_lock_wait_ms, "Timed out waiting for connect lock");
                return false;
            }
        };

        // Another caller may have connected while we waited.
        if self.is_connected() {
            return true;
        }
        if self.is_stopping() {
            return false;
        }

        match self.open_session().await {
            Ok(session) => {
                self.session.store(Some(Arc::new(ActiveSession {
                    inner: session,
                    opened_at: Instant::now(),
                })));
                metrics::record_connection_state(true);
                tracing::info!(
                    endpoint = %self.config.websocket_url,
                    network_id = self.config.network_id,
                    "Ledger session opened"
                );
                true
            }
            Err(e) => {
                metrics::record_connection_state(false);
                if periodic {
                    tracing::debug!(error = %e, "Periodic reconnect failed");
                } else {
                    tracing::warn!(endpoint = %self.config.websocket_url, error = %e, "Ledger connection failed");
                }
                false
            }
        }
    }

    async fn open_session(&self) -> LedgerResult<Arc<dyn LedgerSession>> {
        let endpoint = url::Url::parse(&self.config.websocket_url).map_err(|e| {
            LedgerError::Connection(format!(
                "Invalid websocket URL '{}': {}",
                self.config.websocket_url, e
            ))
        })?;

        let session = timeout(self.rpc_timeout, self.connector.open(endpoint.as_str()))
            .await
            .map_err(|_| LedgerError::Connection("session open timed out".to_string()))??;

        let chain_id = match timeout(self.rpc_timeout, session.chain_id()).await {
            Ok(Ok(chain_id)) => chain_id,
            Ok(Err(e)) => {
                session.close().await;
                return Err(e);
            }
            Err(_) => {
                session.close().await;
                return Err(LedgerError::Connection("eth_chainId timed out".to_string()));
            }
        };

        if chain_id != self.config.network_id {
            session.close().await;
            tracing::error!(
                expected = self.config.network_id,
                actual = chain_id,
                "Ledger node reports a different chain, session rejected"
            );
            return Err(LedgerError::ChainMismatch {
                expected: self.config.network_id,
                actual: chain_id,
            });
        }

        Ok(session)
    }

    /// Connect, retrying `attempts` times with the fixed retry interval.
    pub async fn ensure_connected(&self, attempts: u32) -> LedgerResult<()> {
        let attempts = attempts.max(1);
        let interval = Duration::from_secs(self.config.connect_retry_interval_secs);

        for attempt in 1..=attempts {
            if self.is_stopping() {
                return Err(LedgerError::Connection("service is stopping".to_string()));
            }
            if self.connect(false).await {
                return Ok(());
            }
            if attempt < attempts {
                tracing::info!(attempt = attempt, max_attempts = attempts, "Waiting before next connection attempt");
                time::sleep(interval).await;
            }
        }

        Err(LedgerError::Connection(format!(
            "not connected to {} after {} attempts",
            self.config.websocket_url, attempts
        )))
    }

    fn current_session(&self) -> LedgerResult<Arc<dyn LedgerSession>> {
        self.session
            .load_full()
            .filter(|active| active.inner.is_alive())
            .map(|active| active.inner.clone())
            .ok_or_else(|| LedgerError::Connection("no ledger session".to_string()))
    }

    fn drop_session(&self, dead: &Arc<dyn LedgerSession>) {
        let current = self.session.load_full();
        if let Some(active) = current {
            if Arc::ptr_eq(&active.inner, dead) {
                self.session.store(None);
                metrics::record_connection_state(false);
                tracing::warn!(
                    uptime_secs = active.opened_at.elapsed().as_secs(),
                    "Ledger session lost"
                );
            }
        }
    }

    async fn rpc<T, F, Fut>(&self, method: &'static str, op: F) -> LedgerResult<T>
    where
        F: FnOnce(Arc<dyn LedgerSession>) -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let session = self.current_session()?;
        let started = Instant::now();

        let result = match timeout(self.rpc_timeout, op(session.clone())).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Connection(format!(
                "{} timed out after {}s",
                method,
                self.rpc_timeout.as_secs()
            ))),
        };

        metrics::record_rpc_call(method, started.elapsed(), result.is_ok());
        if let Err(e) = &result {
            tracing::debug!(method = method, error = %e, "RPC failed");
            if !session.is_alive() {
                self.drop_session(&session);
            }
        }
        result
    }

    pub async fn chain_id(&self) -> LedgerResult<u64> {
        self.rpc("eth_chainId", |s| async move { s.chain_id().await })
            .await
    }

    pub async fn block_number(&self) -> LedgerResult<u64> {
        self.rpc("eth_blockNumber", |s| async move { s.block_number().await })
            .await
    }

    pub async fn gas_price(&self) -> LedgerResult<u128> {
        self.rpc("eth_gasPrice", |s| async move { s.gas_price().await })
            .await
    }

    pub async fn transaction_count(&self, address: Address, tag: NonceTag) -> LedgerResult<u64> {
        self.rpc("eth_getTransactionCount", |s| async move {
            s.transaction_count(address, tag).await
        })
        .await
    }

    pub async fn balance(&self, address: Address) -> LedgerResult<U256> {
        self.balances
            .get_or_fetch(address, || {
                self.rpc("eth_getBalance", |s| async move { s.balance(address).await })
            })
            .await
    }

    /// Token balance of `owner` on `token`, via `balanceOf`.
    pub async fn token_balance(&self, token: Address, owner: Address) -> LedgerResult<U256> {
        self.token_balances
            .get_or_fetch((token, owner), || async move {
                let output = self.call(token, contract::balance_of_call(owner)).await?;
                contract::decode_balance(&output)
            })
            .await
    }

    pub async fn transaction(&self, hash: TxHash) -> LedgerResult<Option<LedgerTransaction>> {
        self.transactions
            .get_or_fetch(hash, || {
                self.rpc("eth_getTransactionByHash", |s| async move {
                    s.transaction(hash).await
                })
            })
            .await
    }

    pub async fn receipt(&self, hash: TxHash) -> LedgerResult<Option<LedgerReceipt>> {
        self.receipts
            .get_or_fetch(hash, || {
                self.rpc("eth_getTransactionReceipt", |s| async move {
                    s.receipt(hash).await
                })
            })
            .await
    }

    pub async fn call(&self, to: Address, input: Bytes) -> LedgerResult<Bytes> {
        self.rpc("eth_call", |s| async move { s.call(to, input).await })
            .await
    }

    pub async fn logs(&self, filter: LogFilter, to_block: u64) -> LedgerResult<Vec<ObservedLog>> {
        self.rpc("eth_getLogs", |s| async move { s.logs(filter, to_block).await })
            .await
    }

    pub async fn subscribe_logs(&self, filter: LogFilter) -> LedgerResult<LogStream> {
        self.rpc("eth_subscribe", |s| async move { s.subscribe_logs(filter).await })
            .await
    }

    /// Broadcast a signed payload. A timeout counts as a network failure.
    pub async fn send_raw(&self, raw: Bytes) -> LedgerResult<TxHash> {
        let session = self
            .current_session()
            .map_err(|e| LedgerError::SubmissionNetwork(e.to_string()))?;
        let started = Instant::now();

        let result = match timeout(self.rpc_timeout, session.send_raw(raw)).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::SubmissionNetwork(
                "eth_sendRawTransaction timed out".to_string(),
            )),
        };

        metrics::record_rpc_call("eth_sendRawTransaction", started.elapsed(), result.is_ok());
        if result.is_err() && !session.is_alive() {
            self.drop_session(&session);
        }
        result
    }

    /// Forget cached lookups for `hash` so the next read hits the ledger.
    pub fn invalidate(&self, hash: &TxHash) {
        self.transactions.invalidate(hash);
        self.receipts.invalidate(hash);
    }

    pub fn invalidate_balance(&self, address: &Address) {
        self.balances.invalidate(address);
    }

    pub fn evict_expired(&self) -> usize {
        self.transactions.evict_expired()
            + self.receipts.evict_expired()
            + self.balances.evict_expired()
            + self.token_balances.evict_expired()
    }

    /// Probe the session and reconnect if it is gone. Errors are logged, never returned.
    pub async fn check_connection(&self) {
        if self.is_stopping() {
            return;
        }

        if self.is_connected() {
            match self.block_number().await {
                Ok(block) => {
                    tracing::trace!(block = block, "Ledger session healthy");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Ledger health probe failed");
                    if let Ok(session) = self.current_session() {
                        session.close().await;
                        self.drop_session(&session);
                    }
                }
            }
        }

        self.connect(true).await;
    }

    pub async fn run_health_check(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_secs(self.config.health_check_interval_secs);
        tracing::info!(interval_secs = interval.as_secs(), "Connection health check starting");

        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_connection().await;
                    self.evict_expired();
                }
                _ = shutdown.recv() => {
                    tracing::info!("Connection health check received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Mark the manager as stopping and close the session.
    pub async fn close(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _guard = self.connect_lock.lock().await;
        if let Some(active) = self.session.swap(None) {
            active.inner.close().await;
            metrics::record_connection_state(false);
            tracing::info!("Ledger session closed");
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("websocket_url", &self.config.websocket_url)
            .field("network_id", &self.config.network_id)
            .field("connected", &self.is_connected())
            .field("listening", &self.is_listening())
            .finish()
    }
}
