//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the keeper.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the ledger keeper.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct KeeperConfig {
    /// Ledger node, contract and background task settings.
    pub ledger: LedgerConfig,

    /// Submission, timeout and boost policy.
    pub transactions: TransactionConfig,

    /// Where the administrative key comes from.
    pub wallet: WalletConfig,

    /// Snapshot files for the in-process stores.
    pub storage: StorageConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Ledger integration configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Chain ID the node must report (e.g., 1 for mainnet, 31337 for local Anvil).
    pub network_id: u64,

    /// Websocket endpoint of the ledger node (`ws://` or `wss://`).
    pub websocket_url: String,

    /// Token contract whose calls are dispatched and whose logs are watched.
    pub contract_address: String,

    /// Decimals of the token contract.
    pub contract_decimals: u8,

    /// Gas limit for every signed transaction.
    pub gas_limit: u64,

    /// Per-call RPC timeout in seconds.
    pub rpc_timeout_secs: u64,

    /// Reconciliation sweep interval in seconds.
    pub polling_interval_secs: u64,

    /// How long a caller waits for the connect lock before giving up.
    pub connect_lock_wait_ms: u64,

    /// Fixed pause between `ensure_connected` attempts.
    pub connect_retry_interval_secs: u64,

    /// Attempts made by `ensure_connected` before failing.
    pub connect_attempts: u32,

    /// Connection health check interval in seconds.
    pub health_check_interval_secs: u64,

    /// Subscription liveness check interval in seconds.
    pub subscription_check_interval_secs: u64,

    /// Lifetime of single-flight read results.
    pub cache_ttl_secs: u64,

    /// Gas price multiplier (1.0 = network price, 1.2 = 20% buffer).
    pub gas_price_multiplier: f64,

    /// Maximum gas price in gwei (protection against spikes).
    pub max_gas_price_gwei: u64,

    /// Keep the log subscription open even with nothing pending.
    pub permanently_watch: bool,

    /// Record mined transactions discovered through contract logs.
    pub record_observed_transactions: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            websocket_url: "ws://localhost:8546".to_string(),
            contract_address: String::new(),
            contract_decimals: 18,
            gas_limit: 100_000,
            rpc_timeout_secs: 10,
            polling_interval_secs: 15,
            connect_lock_wait_ms: 10_000,
            connect_retry_interval_secs: 5,
            connect_attempts: 3,
            health_check_interval_secs: 30,
            subscription_check_interval_secs: 15,
            cache_ttl_secs: 5,
            gas_price_multiplier: 1.0,
            max_gas_price_gwei: 500,
            permanently_watch: false,
            record_observed_transactions: true,
        }
    }
}

/// Transaction lifecycle policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Submitted-but-unmined transactions a sender may have outstanding.
    pub max_pending_per_sender: usize,

    /// Sending attempts after which a record stops being resent.
    pub max_sending_attempts: u32,

    /// Days a record may stay pending before the timeout policy applies (0 disables).
    pub pending_max_days: u64,

    /// Minimum interval between refreshes of the chain pending nonce.
    pub nonce_refresh_secs: u64,

    /// Enable fee boosting of stuck transactions.
    pub boost_enabled: bool,

    /// Wait after `sent_timestamp` before a record may be boosted.
    pub boost_after_secs: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_pending_per_sender: 1,
            max_sending_attempts: 3,
            pending_max_days: 3,
            nonce_refresh_secs: 15,
            boost_enabled: true,
            boost_after_secs: 2 * 60 * 60,
        }
    }
}

/// Origin of the administrative key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretSource {
    /// Hex private key in an environment variable.
    Env,
    /// Encrypted JSON keystore, passphrase from an environment variable.
    Keystore,
}

/// Wallet configuration. Key material itself is never stored in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WalletConfig {
    pub source: SecretSource,

    /// Environment variable holding the hex private key (`source = "env"`).
    pub key_env_var: String,

    /// Path of the keystore file (`source = "keystore"`).
    pub keystore_path: Option<String>,

    /// Environment variable holding the keystore passphrase.
    pub passphrase_env_var: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            source: SecretSource::Env,
            key_env_var: "LEDGER_KEEPER_ADMIN_KEY".to_string(),
            keystore_path: None,
            passphrase_env_var: "LEDGER_KEEPER_KEYSTORE_PASSPHRASE".to_string(),
        }
    }
}

/// Persistence of the in-process stores.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON snapshot of transaction records, loaded at start and written at stop.
    pub records_path: Option<String>,

    /// JSON snapshot of watch checkpoints.
    pub checkpoint_path: Option<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: KeeperConfig = toml::from_str(
            r#"
            [ledger]
            network_id = 31337
            websocket_url = "ws://127.0.0.1:8545"
            contract_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
            "#,
        )
        .unwrap();

        assert_eq!(config.ledger.network_id, 31337);
        assert_eq!(config.ledger.polling_interval_secs, 15);
        assert_eq!(config.transactions.max_pending_per_sender, 1);
        assert_eq!(config.transactions.boost_after_secs, 7200);
        assert_eq!(config.wallet.source, SecretSource::Env);
        assert!(config.storage.records_path.is_none());
    }

    #[test]
    fn test_keystore_source() {
        let config: KeeperConfig = toml::from_str(
            r#"
            [wallet]
            source = "keystore"
            keystore_path = "/etc/keeper/admin.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.wallet.source, SecretSource::Keystore);
        assert_eq!(
            config.wallet.keystore_path.as_deref(),
            Some("/etc/keeper/admin.json")
        );
    }
}
