//! The keeper facade used by the surrounding application.
//!
//! # Responsibilities
//! - Validate a send request, check funds, allocate a nonce, sign and persist the
//!   record, then hand it to the dispatcher in the background
//! - Answer balance and nonce queries through the connection manager
//! - Start and stop the background loops (health check, subscription liveness,
//!   reconciliation)
//!
//! A `send_*` call either fails with a pre-submission error or returns a pending
//! record. Everything after that is reported on the notification bus.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, TxHash, U256};
use tokio::task::JoinHandle;

use crate::blockchain::client::ConnectionManager;
use crate::blockchain::contract::{encode_call, CallArguments, ContractMethod, WATCHED_EVENT};
use crate::blockchain::secret::{SecretAccess, SecretRef};
use crate::blockchain::session::{LedgerConnector, LogFilter};
use crate::blockchain::transaction::{to_base_units, GasPolicy, TransferPayload, NATIVE_DECIMALS};
use crate::blockchain::types::{LedgerError, LedgerResult};
use crate::blockchain::wallet::SigningAuthority;
use crate::config::schema::KeeperConfig;
use crate::events::bus::NotificationBus;
use crate::events::checkpoint::CheckpointStore;
use crate::events::watcher::{EventWatcher, LogHandler};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::transactions::dispatcher::Dispatcher;
use crate::transactions::nonce::NonceAllocator;
use crate::transactions::reconciler::Reconciler;
use crate::transactions::record::TransactionRecord;
use crate::transactions::store::TransactionStore;

/// Storage and transport the keeper runs on.
pub struct KeeperDeps {
    pub connector: Arc<dyn LedgerConnector>,
    pub secrets: Arc<dyn SecretAccess>,
    pub store: Arc<dyn TransactionStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub bus: Arc<dyn NotificationBus>,
}

pub struct LedgerKeeper {
    config: KeeperConfig,
    secret: SecretRef,
    contract: Option<Address>,
    connection: Arc<ConnectionManager>,
    authority: Arc<SigningAuthority>,
    nonces: NonceAllocator,
    store: Arc<dyn TransactionStore>,
    dispatcher: Arc<Dispatcher>,
    watcher: Arc<EventWatcher>,
    reconciler: Arc<Reconciler>,
    gas_policy: GasPolicy,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LedgerKeeper {
    pub fn new(config: KeeperConfig, deps: KeeperDeps) -> LedgerResult<Self> {
        let ledger = config.ledger.clone();
        let contract = parse_contract(&ledger.contract_address)?;
        let secret = SecretRef::from_config(&config.wallet)?;

        let connection = Arc::new(ConnectionManager::new(ledger.clone(), deps.connector));
        let authority = Arc::new(SigningAuthority::new(
            deps.secrets,
            ledger.network_id,
            ledger.gas_limit,
        ));
        let nonces = NonceAllocator::new(
            connection.clone(),
            deps.store.clone(),
            Duration::from_secs(config.transactions.nonce_refresh_secs),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            connection.clone(),
            deps.store.clone(),
            deps.bus.clone(),
            config.transactions.clone(),
            ledger.network_id,
        ));
        let filter = LogFilter {
            address: contract.unwrap_or(Address::ZERO),
            topic0: WATCHED_EVENT,
            from_block: 0,
        };
        let watcher = Arc::new(EventWatcher::new(
            connection.clone(),
            deps.checkpoints.clone(),
            deps.bus.clone(),
            filter,
        ));
        let reconciler = Arc::new(Reconciler::new(
            connection.clone(),
            deps.store.clone(),
            deps.checkpoints,
            deps.bus,
            dispatcher.clone(),
            authority.clone(),
            watcher.clone(),
            &ledger,
            config.transactions.clone(),
        ));
        let handler: Arc<dyn LogHandler> = reconciler.clone();
        watcher.set_handler(Arc::downgrade(&handler));

        Ok(Self {
            gas_policy: GasPolicy::from_config(&ledger),
            config,
            secret,
            contract,
            connection,
            authority,
            nonces,
            store: deps.store,
            dispatcher,
            watcher,
            reconciler,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn watcher(&self) -> &Arc<EventWatcher> {
        &self.watcher
    }

    /// Decrypt the administrative key. A failure halts sends until [`LedgerKeeper::reload_key`] succeeds.
    pub fn unlock(&self) -> LedgerResult<Address> {
        self.authority.decrypt_key(&self.secret)
    }

    pub fn reload_key(&self) -> LedgerResult<Address> {
        self.authority.reload_key(&self.secret)
    }

    pub fn admin_address(&self) -> Option<Address> {
        self.authority.address()
    }

    /// Send `amount` wei to `to`.
    pub async fn send_value(
        &self,
        to: Address,
        amount: U256,
        label: Option<String>,
    ) -> LedgerResult<TransactionRecord> {
        if to == Address::ZERO {
            return Err(LedgerError::InvalidRequest("recipient must not be the zero address".to_string()));
        }
        if amount.is_zero() {
            return Err(LedgerError::InvalidRequest("amount must be positive".to_string()));
        }

        let (sender, gas_price) = self.prepare().await?;
        let fee = U256::from(gas_price) * U256::from(self.config.ledger.gas_limit);
        let required = amount.saturating_add(fee);
        let available = self.connection.balance(sender).await?;
        if available < required {
            return Err(LedgerError::InsufficientFunds {
                required,
                available,
            });
        }

        let mut record = TransactionRecord::new(self.config.ledger.network_id, sender);
        record.to = Some(to);
        record.value = amount;
        record.label = label;
        self.sign_and_dispatch(record, TransferPayload::Value { to, value: amount }, gas_price)
            .await
    }

    /// Call `method` on the token contract moving `amount` base units to `to`.
    pub async fn send_contract_call(
        &self,
        to: Address,
        amount: U256,
        method: ContractMethod,
        label: Option<String>,
    ) -> LedgerResult<TransactionRecord> {
        let contract = self.contract.ok_or_else(|| {
            LedgerError::InvalidRequest("no token contract configured".to_string())
        })?;
        if to == Address::ZERO {
            return Err(LedgerError::InvalidRequest("recipient must not be the zero address".to_string()));
        }
        let input = encode_call(
            &method.name,
            &CallArguments {
                recipient: to,
                amount,
                owner: method.owner,
            },
        )?;

        let (sender, gas_price) = self.prepare().await?;
        let holder = method.owner.unwrap_or(sender);
        if !amount.is_zero() {
            let available = self.connection.token_balance(contract, holder).await?;
            if available < amount {
                return Err(LedgerError::InsufficientFunds {
                    required: amount,
                    available,
                });
            }
        }

        let mut record = TransactionRecord::new(self.config.ledger.network_id, sender);
        record.to = Some(to);
        record.contract_address = Some(contract);
        record.contract_amount = amount;
        record.method_name = Some(method.name);
        record.label = label;
        self.sign_and_dispatch(record, TransferPayload::ContractCall { contract, input }, gas_price)
            .await
    }

    /// [`Self::send_value`] with a decimal amount in whole native units ("0.25").
    pub async fn send_value_decimal(
        &self,
        to: Address,
        amount: &str,
        label: Option<String>,
    ) -> LedgerResult<TransactionRecord> {
        let amount = to_base_units(amount, NATIVE_DECIMALS)?;
        self.send_value(to, amount, label).await
    }

    /// [`Self::send_contract_call`] with a decimal amount in whole tokens.
    pub async fn send_contract_call_decimal(
        &self,
        to: Address,
        amount: &str,
        method: ContractMethod,
        label: Option<String>,
    ) -> LedgerResult<TransactionRecord> {
        let amount = to_base_units(amount, self.config.ledger.contract_decimals)?;
        self.send_contract_call(to, amount, method, label).await
    }

    async fn prepare(&self) -> LedgerResult<(Address, u128)> {
        let sender = self.authority.ensure_ready()?;
        self.connection
            .ensure_connected(self.config.ledger.connect_attempts)
            .await?;
        let gas_price = self.gas_policy.apply(self.connection.gas_price().await?)?;
        Ok((sender, gas_price))
    }

    async fn sign_and_dispatch(
        &self,
        mut record: TransactionRecord,
        payload: TransferPayload,
        gas_price: u128,
    ) -> LedgerResult<TransactionRecord> {
        let lease = self.nonces.allocate(record.from).await?;
        let signed = self
            .authority
            .build_and_sign(&payload, lease.nonce(), gas_price)
            .await?;

        record.nonce = lease.nonce();
        record.gas_price = gas_price;
        record.mark_signed(&signed);
        self.store.save(&record, false).await?;
        lease.commit();
        self.connection.invalidate_balance(&record.from);
        metrics::record_transition(record.state.as_str());

        let in_flight = self.store.count_pending_sent(record.from).await?;
        if in_flight >= self.config.transactions.max_pending_per_sender {
            tracing::info!(
                tx_hash = %signed.hash,
                nonce = record.nonce,
                in_flight = in_flight,
                "Sender at pending limit, transaction queued"
            );
        } else {
            drop(self.dispatcher.submit(record.clone()));
        }

        tracing::info!(
            tx_hash = %signed.hash,
            nonce = record.nonce,
            to = ?record.to,
            "Transaction accepted for processing"
        );
        Ok(record)
    }

    pub async fn get_balance(&self, address: Address) -> LedgerResult<U256> {
        self.connection
            .ensure_connected(self.config.ledger.connect_attempts)
            .await?;
        self.connection.balance(address).await
    }

    pub async fn get_token_balance(&self, address: Address) -> LedgerResult<U256> {
        let contract = self.contract.ok_or_else(|| {
            LedgerError::InvalidRequest("no token contract configured".to_string())
        })?;
        self.connection
            .ensure_connected(self.config.ledger.connect_attempts)
            .await?;
        self.connection.token_balance(contract, address).await
    }

    /// Next nonce `address` would be assigned.
    pub async fn get_nonce_for(&self, address: Address) -> LedgerResult<u64> {
        self.connection
            .ensure_connected(self.config.ledger.connect_attempts)
            .await?;
        self.nonces.peek(address).await
    }

    pub async fn refresh_from_ledger(&self, hash: TxHash) -> LedgerResult<TransactionRecord> {
        self.connection
            .ensure_connected(self.config.ledger.connect_attempts)
            .await?;
        self.reconciler
            .refresh_from_ledger(hash)
            .await?
            .ok_or_else(|| LedgerError::InvalidRequest(format!("no record for transaction {}", hash)))
    }

    pub async fn start_watching_blockchain(&self) -> LedgerResult<()> {
        if self.contract.is_none() {
            return Err(LedgerError::InvalidRequest("no token contract configured".to_string()));
        }
        self.watcher.start_watching(None).await
    }

    pub fn stop_watching_blockchain(&self) {
        self.watcher.stop_watching();
    }

    /// Spawn the background loops. They exit when `shutdown` is triggered.
    pub fn start(&self, shutdown: &Shutdown) {
        self.connection.resume();
        let handles = vec![
            tokio::spawn(self.connection.clone().run_health_check(shutdown.subscribe())),
            tokio::spawn(self.watcher.clone().run_liveness(shutdown.subscribe())),
            tokio::spawn(self.reconciler.clone().run(shutdown.subscribe())),
        ];
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
        tracing::info!(
            network_id = self.config.ledger.network_id,
            contract = ?self.contract,
            "Ledger keeper started"
        );
    }

    /// Stop watching, signal the loops and wait for them, close the session.
    pub async fn stop(&self, shutdown: &Shutdown) {
        self.watcher.stop_watching();
        if !shutdown.is_triggered() {
            shutdown.trigger();
        }
        tracing::debug!(receivers = shutdown.receiver_count(), "Waiting for background tasks");
        let handles: Vec<_> = self
            .tasks
            .lock()
            .map(|mut tasks| tasks.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.connection.close().await;
        tracing::info!("Ledger keeper stopped");
    }
}

fn parse_contract(raw: &str) -> LedgerResult<Option<Address>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<Address>()
        .map(Some)
        .map_err(|e| LedgerError::InvalidRequest(format!("invalid contract address '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_contract() {
        assert_eq!(parse_contract("").unwrap(), None);
        assert_eq!(
            parse_contract(" 0x0000000000000000000000000000000000000001 ").unwrap(),
            Some(Address::with_last_byte(1))
        );
        assert!(parse_contract("0x12").is_err());
    }
}
