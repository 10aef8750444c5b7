//! Transaction payloads, gas pricing and unit conversion.
//!
//! # Responsibilities
//! - Describe the two payload shapes the keeper signs (value transfer, contract call)
//! - Apply the gas price policy (multiplier, ceiling)
//! - Convert decimal amounts to and from base units

use alloy::consensus::{Transaction as _, TxEnvelope};
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::utils::{format_units, parse_units};
use alloy::primitives::{Address, Bytes, TxHash, U256};
use serde::{Deserialize, Serialize};

use crate::blockchain::types::{LedgerError, LedgerResult};
use crate::config::schema::LedgerConfig;

pub const GWEI: u128 = 1_000_000_000;

/// Decimals of the native currency.
pub const NATIVE_DECIMALS: u8 = 18;

/// What a signed transaction carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPayload {
    /// Plain native value transfer.
    Value { to: Address, value: U256 },
    /// Call into a contract with encoded input and no attached value.
    ContractCall { contract: Address, input: Bytes },
}

impl TransferPayload {
    pub fn to(&self) -> Address {
        match self {
            TransferPayload::Value { to, .. } => *to,
            TransferPayload::ContractCall { contract, .. } => *contract,
        }
    }

    pub fn value(&self) -> U256 {
        match self {
            TransferPayload::Value { value, .. } => *value,
            TransferPayload::ContractCall { .. } => U256::ZERO,
        }
    }

    pub fn input(&self) -> Bytes {
        match self {
            TransferPayload::Value { .. } => Bytes::new(),
            TransferPayload::ContractCall { input, .. } => input.clone(),
        }
    }

    /// Recover the payload of a signed EIP-2718 transaction.
    pub fn from_raw(raw: &[u8]) -> LedgerResult<Self> {
        let envelope = TxEnvelope::decode_2718(&mut &raw[..])
            .map_err(|e| LedgerError::InvalidRequest(format!("undecodable signed payload: {}", e)))?;
        let to = envelope
            .to()
            .ok_or_else(|| LedgerError::InvalidRequest("contract creation is not supported".to_string()))?;

        if envelope.input().is_empty() {
            Ok(TransferPayload::Value {
                to,
                value: envelope.value(),
            })
        } else {
            Ok(TransferPayload::ContractCall {
                contract: to,
                input: envelope.input().clone(),
            })
        }
    }
}

/// EIP-2718 encoded signed payload and its canonical hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub hash: TxHash,
}

/// Network gas price → price used for signing.
#[derive(Debug, Clone, Copy)]
pub struct GasPolicy {
    multiplier: f64,
    max_gwei: u64,
}

impl GasPolicy {
    pub fn new(multiplier: f64, max_gwei: u64) -> Self {
        Self {
            multiplier,
            max_gwei,
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new(config.gas_price_multiplier, config.max_gas_price_gwei)
    }

    /// Adjusted price in wei, or `GasPriceTooHigh` when the adjusted price is above the ceiling.
    pub fn apply(&self, network_price: u128) -> LedgerResult<u128> {
        let adjusted = ((network_price as f64 * self.multiplier) as u128).max(network_price);
        if adjusted > u128::from(self.max_gwei) * GWEI {
            return Err(LedgerError::GasPriceTooHigh {
                current_gwei: adjusted / GWEI,
                max_gwei: self.max_gwei,
            });
        }
        Ok(adjusted)
    }
}

/// Convert a decimal amount string ("1.5") into base units.
pub fn to_base_units(amount: &str, decimals: u8) -> LedgerResult<U256> {
    let amount = amount.trim();
    if amount.starts_with('-') {
        return Err(LedgerError::InvalidRequest(format!(
            "amount '{}' must not be negative",
            amount
        )));
    }
    parse_units(amount, decimals)
        .map(|parsed| parsed.get_absolute())
        .map_err(|e| LedgerError::InvalidRequest(format!("invalid amount '{}': {}", amount, e)))
}

/// Render base units as a decimal string.
pub fn from_base_units(value: U256, decimals: u8) -> LedgerResult<String> {
    format_units(value, decimals)
        .map_err(|e| LedgerError::InvalidRequest(format!("cannot format {}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gas_policy() {
        let policy = GasPolicy::new(1.2, 100);
        assert_eq!(policy.apply(10 * GWEI).unwrap(), 12 * GWEI);

        let err = policy.apply(150 * GWEI).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::GasPriceTooHigh {
                current_gwei: 180,
                max_gwei: 100
            }
        ));

        // The multiplier can push a price under the ceiling over it.
        let err = policy.apply(90 * GWEI).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::GasPriceTooHigh {
                current_gwei: 108,
                max_gwei: 100
            }
        ));
        assert_eq!(policy.apply(80 * GWEI).unwrap(), 96 * GWEI);
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(
            to_base_units("1.5", NATIVE_DECIMALS).unwrap(),
            U256::from(1_500_000_000_000_000_000u128)
        );
        assert_eq!(to_base_units("2", 6).unwrap(), U256::from(2_000_000u64));
        assert!(to_base_units("-1", 6).is_err());
        assert!(to_base_units("abc", 6).is_err());

        assert_eq!(from_base_units(U256::from(2_500_000u64), 6).unwrap(), "2.500000");
    }

    #[test]
    fn test_payload_accessors() {
        let to = Address::repeat_byte(3);
        let value = TransferPayload::Value {
            to,
            value: U256::from(9u64),
        };
        assert_eq!(value.to(), to);
        assert!(value.input().is_empty());

        let call = TransferPayload::ContractCall {
            contract: to,
            input: Bytes::from_static(&[1, 2, 3]),
        };
        assert_eq!(call.value(), U256::ZERO);
        assert_eq!(call.input().len(), 3);
    }
}
