//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (intervals, limits, multipliers)
//! - Check that endpoint and contract address parse
//!
//! Returns all validation errors, not just the first.

use alloy::primitives::Address;
use thiserror::Error;

use crate::config::schema::{KeeperConfig, SecretSource};

/// Shortest reconciliation interval accepted.
pub const MIN_POLLING_INTERVAL_SECS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &KeeperConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let ledger = &config.ledger;

    if ledger.network_id == 0 {
        errors.push(ValidationError::new("ledger.network_id", "must be greater than 0"));
    }

    match url::Url::parse(&ledger.websocket_url) {
        Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
        Ok(url) => errors.push(ValidationError::new(
            "ledger.websocket_url",
            format!("unsupported scheme '{}', expected ws or wss", url.scheme()),
        )),
        Err(e) => errors.push(ValidationError::new(
            "ledger.websocket_url",
            format!("invalid URL: {}", e),
        )),
    }

    if ledger.contract_address.parse::<Address>().is_err() {
        errors.push(ValidationError::new(
            "ledger.contract_address",
            format!("'{}' is not a valid address", ledger.contract_address),
        ));
    }

    if ledger.polling_interval_secs < MIN_POLLING_INTERVAL_SECS {
        errors.push(ValidationError::new(
            "ledger.polling_interval_secs",
            format!("must be at least {}", MIN_POLLING_INTERVAL_SECS),
        ));
    }

    for (field, value) in [
        ("ledger.rpc_timeout_secs", ledger.rpc_timeout_secs),
        ("ledger.health_check_interval_secs", ledger.health_check_interval_secs),
        (
            "ledger.subscription_check_interval_secs",
            ledger.subscription_check_interval_secs,
        ),
        ("ledger.gas_limit", ledger.gas_limit),
        ("ledger.connect_attempts", u64::from(ledger.connect_attempts)),
        (
            "transactions.max_sending_attempts",
            u64::from(config.transactions.max_sending_attempts),
        ),
        (
            "transactions.max_pending_per_sender",
            config.transactions.max_pending_per_sender as u64,
        ),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if !(ledger.gas_price_multiplier >= 1.0) {
        errors.push(ValidationError::new(
            "ledger.gas_price_multiplier",
            "must be at least 1.0",
        ));
    }

    if config.wallet.source == SecretSource::Keystore && config.wallet.keystore_path.is_none() {
        errors.push(ValidationError::new(
            "wallet.keystore_path",
            "required when source is keystore",
        ));
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<std::net::SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "must be a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
