//! Shared utilities for integration testing: an in-memory ledger behind the
//! session seam, a fixed signing key, and keeper wiring.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::consensus::{Transaction as _, TxEnvelope};
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{Address, Bytes, TxHash, B256, U256};
use alloy::sol_types::SolValue;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;

use ledger_keeper::blockchain::contract::WATCHED_EVENT;
use ledger_keeper::blockchain::secret::{parse_private_key, SecretAccess, SecretRef};
use ledger_keeper::blockchain::session::{LedgerConnector, LedgerSession, LogFilter, LogStream, NonceTag};
use ledger_keeper::blockchain::types::{
    LedgerError, LedgerReceipt, LedgerResult, LedgerTransaction, ObservedLog,
};
use ledger_keeper::config::KeeperConfig;
use ledger_keeper::events::{BroadcastBus, MemoryCheckpointStore};
use ledger_keeper::transactions::{
    MemoryTransactionStore, TransactionRecord, TransactionState, TransactionStore,
};
use ledger_keeper::{KeeperDeps, LedgerKeeper};

pub const CHAIN_ID: u64 = 31337;
pub const GWEI: u128 = 1_000_000_000;

// Well-known test private key (Anvil's first account)
pub const TEST_PRIVATE_KEY: &str =
    "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub fn admin() -> Address {
    "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap()
}

pub fn token() -> Address {
    Address::repeat_byte(0x70)
}

pub fn recipient() -> Address {
    Address::repeat_byte(0x22)
}

/// How the mock answers `send_raw`.
#[derive(Debug, Clone)]
pub enum SendMode {
    Accept,
    NetworkError,
    Reject(String),
}

struct LedgerState {
    chain_id: u64,
    block_number: u64,
    gas_price: u128,
    sender: Address,
    balances: HashMap<Address, U256>,
    token_balances: HashMap<Address, U256>,
    pending_counts: HashMap<Address, u64>,
    latest_counts: HashMap<Address, u64>,
    transactions: HashMap<TxHash, LedgerTransaction>,
    receipts: HashMap<TxHash, LedgerReceipt>,
    logs: Vec<ObservedLog>,
    sent: Vec<TxHash>,
    send_mode: SendMode,
    refuse_connections: bool,
    subscribers: Vec<mpsc::UnboundedSender<ObservedLog>>,
}

struct Inner {
    state: Mutex<LedgerState>,
    alive: AtomicBool,
    opens: AtomicUsize,
    transaction_lookups: AtomicUsize,
    count_lookups: AtomicUsize,
    send_attempts: AtomicUsize,
    lookup_delay: Mutex<Duration>,
}

/// In-memory ledger. Every clone shares the same chain.
#[derive(Clone)]
pub struct MockLedger {
    inner: Arc<Inner>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LedgerState {
                    chain_id: CHAIN_ID,
                    block_number: 100,
                    gas_price: 2 * GWEI,
                    sender: admin(),
                    balances: HashMap::from([(admin(), U256::from(10u128.pow(21)))]),
                    token_balances: HashMap::from([(admin(), U256::from(1_000_000u64))]),
                    pending_counts: HashMap::new(),
                    latest_counts: HashMap::new(),
                    transactions: HashMap::new(),
                    receipts: HashMap::new(),
                    logs: Vec::new(),
                    sent: Vec::new(),
                    send_mode: SendMode::Accept,
                    refuse_connections: false,
                    subscribers: Vec::new(),
                }),
                alive: AtomicBool::new(false),
                opens: AtomicUsize::new(0),
                transaction_lookups: AtomicUsize::new(0),
                count_lookups: AtomicUsize::new(0),
                send_attempts: AtomicUsize::new(0),
                lookup_delay: Mutex::new(Duration::ZERO),
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut LedgerState) -> T) -> T {
        let mut state = self.inner.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.with_state(|s| s.chain_id = chain_id);
    }

    pub fn set_block_number(&self, block: u64) {
        self.with_state(|s| s.block_number = block);
    }

    pub fn set_gas_price(&self, price: u128) {
        self.with_state(|s| s.gas_price = price);
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.with_state(|s| s.balances.insert(address, balance));
    }

    pub fn set_token_balance(&self, address: Address, balance: U256) {
        self.with_state(|s| s.token_balances.insert(address, balance));
    }

    pub fn set_pending_count(&self, address: Address, count: u64) {
        self.with_state(|s| s.pending_counts.insert(address, count));
    }

    pub fn set_latest_count(&self, address: Address, count: u64) {
        self.with_state(|s| s.latest_counts.insert(address, count));
    }

    pub fn set_send_mode(&self, mode: SendMode) {
        self.with_state(|s| s.send_mode = mode);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.with_state(|s| s.refuse_connections = refuse);
    }

    pub fn set_lookup_delay(&self, delay: Duration) {
        *self.inner.lookup_delay.lock().unwrap() = delay;
    }

    /// Simulate the transport dropping underneath the keeper.
    pub fn kill_session(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        self.drop_subscriptions();
    }

    /// End every live log stream.
    pub fn drop_subscriptions(&self) {
        self.with_state(|s| s.subscribers.clear());
    }

    pub fn subscriber_count(&self) -> usize {
        self.with_state(|s| s.subscribers.iter().filter(|tx| !tx.is_closed()).count())
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn transaction_lookups(&self) -> usize {
        self.inner.transaction_lookups.load(Ordering::SeqCst)
    }

    pub fn count_lookups(&self) -> usize {
        self.inner.count_lookups.load(Ordering::SeqCst)
    }

    pub fn send_attempts(&self) -> usize {
        self.inner.send_attempts.load(Ordering::SeqCst)
    }

    /// Hashes accepted by `send_raw`, in order.
    pub fn sent(&self) -> Vec<TxHash> {
        self.with_state(|s| s.sent.clone())
    }

    pub fn ledger_transaction(&self, hash: &TxHash) -> Option<LedgerTransaction> {
        self.with_state(|s| s.transactions.get(hash).cloned())
    }

    /// Put a transaction the keeper did not send into the pool.
    pub fn insert_transaction(&self, tx: LedgerTransaction) {
        self.with_state(|s| s.transactions.insert(tx.hash, tx));
    }

    /// Mine a known transaction in `block`.
    pub fn mine(&self, hash: TxHash, block: u64, status: bool, logs: Vec<ObservedLog>) {
        self.with_state(|s| {
            let tx = s
                .transactions
                .get_mut(&hash)
                .expect("mining an unknown transaction");
            tx.block_hash = Some(B256::with_last_byte(block as u8 | 1));
            tx.block_number = Some(block);
            let from = tx.from;
            let nonce = tx.nonce;

            let latest = s.latest_counts.entry(from).or_insert(0);
            *latest = (*latest).max(nonce + 1);
            s.block_number = s.block_number.max(block);
            s.receipts.insert(
                hash,
                LedgerReceipt {
                    hash,
                    from,
                    status,
                    gas_used: 21_000,
                    block_number: Some(block),
                    logs,
                },
            );
        });
    }

    /// Append a log to history and push it to live subscribers.
    pub fn emit_log(&self, log: ObservedLog) {
        self.with_state(|s| {
            s.logs.push(log.clone());
            s.subscribers.retain(|tx| tx.send(log.clone()).is_ok());
        });
    }

    /// Append a log to history only (missed by live subscribers).
    pub fn record_log(&self, log: ObservedLog) {
        self.with_state(|s| s.logs.push(log));
    }

    async fn delay(&self) {
        let delay = *self.inner.lookup_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_alive(&self) -> LedgerResult<()> {
        if self.inner.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LedgerError::Connection("session closed".to_string()))
        }
    }
}

#[async_trait]
impl LedgerConnector for MockLedger {
    async fn open(&self, _endpoint: &str) -> LedgerResult<Arc<dyn LedgerSession>> {
        if self.with_state(|s| s.refuse_connections) {
            return Err(LedgerError::Connection("connection refused".to_string()));
        }
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.alive.store(true, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl LedgerSession for MockLedger {
    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    async fn chain_id(&self) -> LedgerResult<u64> {
        self.check_alive()?;
        Ok(self.with_state(|s| s.chain_id))
    }

    async fn block_number(&self) -> LedgerResult<u64> {
        self.check_alive()?;
        Ok(self.with_state(|s| s.block_number))
    }

    async fn balance(&self, address: Address) -> LedgerResult<U256> {
        self.check_alive()?;
        Ok(self.with_state(|s| s.balances.get(&address).copied().unwrap_or_default()))
    }

    async fn transaction_count(&self, address: Address, tag: NonceTag) -> LedgerResult<u64> {
        self.check_alive()?;
        self.inner.count_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.with_state(|s| {
            let latest = s.latest_counts.get(&address).copied().unwrap_or(0);
            match tag {
                NonceTag::Latest => latest,
                NonceTag::Pending => s.pending_counts.get(&address).copied().unwrap_or(0).max(latest),
            }
        }))
    }

    async fn gas_price(&self) -> LedgerResult<u128> {
        self.check_alive()?;
        Ok(self.with_state(|s| s.gas_price))
    }

    async fn transaction(&self, hash: TxHash) -> LedgerResult<Option<LedgerTransaction>> {
        self.check_alive()?;
        self.inner.transaction_lookups.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        Ok(self.with_state(|s| s.transactions.get(&hash).cloned()))
    }

    async fn receipt(&self, hash: TxHash) -> LedgerResult<Option<LedgerReceipt>> {
        self.check_alive()?;
        Ok(self.with_state(|s| s.receipts.get(&hash).cloned()))
    }

    async fn call(&self, _to: Address, input: Bytes) -> LedgerResult<Bytes> {
        self.check_alive()?;
        // balanceOf(address): 4 byte selector, then the owner left-padded to 32 bytes.
        if input.len() < 36 {
            return Err(LedgerError::SubmissionRejected("execution reverted".to_string()));
        }
        let owner = Address::from_slice(&input[16..36]);
        let balance = self.with_state(|s| s.token_balances.get(&owner).copied().unwrap_or_default());
        Ok(Bytes::from(balance.abi_encode()))
    }

    async fn logs(&self, filter: LogFilter, to_block: u64) -> LedgerResult<Vec<ObservedLog>> {
        self.check_alive()?;
        Ok(self.with_state(|s| {
            s.logs
                .iter()
                .filter(|log| {
                    log.contract == filter.address
                        && log.topics.first() == Some(&filter.topic0)
                        && log.block_number >= filter.from_block
                        && log.block_number <= to_block
                })
                .cloned()
                .collect()
        }))
    }

    async fn send_raw(&self, raw: Bytes) -> LedgerResult<TxHash> {
        self.inner.send_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.is_alive() {
            return Err(LedgerError::SubmissionNetwork("session closed".to_string()));
        }
        let envelope = TxEnvelope::decode_2718(&mut raw.as_ref())
            .map_err(|e| LedgerError::SubmissionRejected(e.to_string()))?;
        let hash = *envelope.tx_hash();

        self.with_state(|s| match s.send_mode.clone() {
            SendMode::Accept => {
                let from = s.sender;
                let tx = LedgerTransaction {
                    hash,
                    from,
                    to: envelope.to(),
                    nonce: envelope.nonce(),
                    value: envelope.value(),
                    gas_price: envelope.gas_price().unwrap_or_default(),
                    input: envelope.input().clone(),
                    block_hash: None,
                    block_number: None,
                };
                let pending = s.pending_counts.entry(from).or_insert(0);
                *pending = (*pending).max(tx.nonce + 1);
                s.transactions.entry(hash).or_insert(tx);
                s.sent.push(hash);
                Ok(hash)
            }
            SendMode::NetworkError => Err(LedgerError::SubmissionNetwork("connection reset".to_string())),
            SendMode::Reject(reason) => Err(LedgerError::SubmissionRejected(reason)),
        })
    }

    async fn subscribe_logs(&self, filter: LogFilter) -> LedgerResult<LogStream> {
        self.check_alive()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|s| s.subscribers.push(tx));
        let stream = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|log| (log, rx)) })
            .filter(move |log: &ObservedLog| {
                let matches = log.contract == filter.address && log.topics.first() == Some(&filter.topic0);
                async move { matches }
            });
        Ok(stream.boxed())
    }

    async fn close(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        self.drop_subscriptions();
    }
}

/// Hands out the test key for any secret reference.
pub struct StaticSecret;

impl SecretAccess for StaticSecret {
    fn decrypt(&self, _secret: &SecretRef) -> LedgerResult<B256> {
        parse_private_key(TEST_PRIVATE_KEY)
    }
}

/// Always fails, as a wrong keystore passphrase would.
pub struct BrokenSecret;

impl SecretAccess for BrokenSecret {
    fn decrypt(&self, _secret: &SecretRef) -> LedgerResult<B256> {
        Err(LedgerError::KeyAccess("keystore passphrase rejected".to_string()))
    }
}

pub fn test_config() -> KeeperConfig {
    let mut config = KeeperConfig::default();
    config.ledger.network_id = CHAIN_ID;
    config.ledger.websocket_url = "ws://ledger.test:8546".to_string();
    config.ledger.contract_address = token().to_string();
    config.ledger.gas_limit = 60_000;
    config.ledger.rpc_timeout_secs = 2;
    config.ledger.connect_retry_interval_secs = 0;
    config.ledger.connect_attempts = 2;
    config.ledger.connect_lock_wait_ms = 500;
    config.ledger.cache_ttl_secs = 5;
    config
}

pub struct TestKeeper {
    pub keeper: Arc<LedgerKeeper>,
    pub ledger: MockLedger,
    pub store: Arc<MemoryTransactionStore>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub bus: Arc<BroadcastBus>,
}

pub fn build_keeper(config: KeeperConfig, ledger: MockLedger) -> TestKeeper {
    build_keeper_with_secret(config, ledger, Arc::new(StaticSecret))
}

pub fn build_keeper_with_secret(
    config: KeeperConfig,
    ledger: MockLedger,
    secrets: Arc<dyn SecretAccess>,
) -> TestKeeper {
    let bus = Arc::new(BroadcastBus::default());
    let store = Arc::new(MemoryTransactionStore::new(None).with_bus(bus.clone()));
    let checkpoints = Arc::new(MemoryCheckpointStore::new(None));
    let keeper = LedgerKeeper::new(
        config,
        KeeperDeps {
            connector: Arc::new(ledger.clone()),
            secrets,
            store: store.clone(),
            checkpoints: checkpoints.clone(),
            bus: bus.clone(),
        },
    )
    .unwrap();

    TestKeeper {
        keeper: Arc::new(keeper),
        ledger,
        store,
        checkpoints,
        bus,
    }
}

/// Unlocked keeper on a fresh mock ledger with default test config.
pub fn unlocked_keeper() -> TestKeeper {
    let keeper = build_keeper(test_config(), MockLedger::new());
    keeper.keeper.unlock().unwrap();
    keeper
}

/// A token Transfer log emitted by the test token in `block`.
pub fn transfer_log(tx_hash: TxHash, from: Address, to: Address, value: u64, block: u64) -> ObservedLog {
    ObservedLog {
        tx_hash,
        contract: token(),
        data: U256::from(value).abi_encode().into(),
        topics: vec![WATCHED_EVENT, from.into_word(), to.into_word()],
        block_number: block,
    }
}

/// Send a value transfer and wait until the ledger has accepted it.
pub async fn send_and_wait(t: &TestKeeper) -> TransactionRecord {
    let record = t
        .keeper
        .send_value(recipient(), U256::from(1_000u64), None)
        .await
        .unwrap();
    let store = t.store.clone();
    let id = record.id;
    assert!(
        wait_for(Duration::from_secs(2), || {
            let store = store.clone();
            async move {
                matches!(store.get(&id).await.unwrap(), Some(r) if r.state == TransactionState::Pending)
            }
        })
        .await,
        "transaction was not submitted"
    );
    t.store.get(&id).await.unwrap().unwrap()
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
