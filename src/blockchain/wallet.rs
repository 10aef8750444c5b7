//! Signing authority for the administrative sender.
//!
//! # Security
//! - Key material is obtained only through [`SecretAccess`]
//! - Keys are never logged or serialized
//! - A key access failure halts administrative sends until [`SigningAuthority::reload_key`] succeeds

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{keccak256, Address, Bytes};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;

use crate::blockchain::secret::{SecretAccess, SecretRef};
use crate::blockchain::transaction::{SignedTransaction, TransferPayload};
use crate::blockchain::types::{LedgerError, LedgerResult};
use crate::observability::metrics;

pub struct SigningAuthority {
    secrets: Arc<dyn SecretAccess>,
    signer: RwLock<Option<PrivateKeySigner>>,
    /// Chain ID for EIP-155 replay protection.
    chain_id: u64,
    gas_limit: u64,
    halted: AtomicBool,
}

impl SigningAuthority {
    pub fn new(secrets: Arc<dyn SecretAccess>, chain_id: u64, gas_limit: u64) -> Self {
        Self {
            secrets,
            signer: RwLock::new(None),
            chain_id,
            gas_limit,
            halted: AtomicBool::new(false),
        }
    }

    /// Decrypt and install the administrative key. Failure halts administrative sends.
    pub fn decrypt_key(&self, secret: &SecretRef) -> LedgerResult<Address> {
        let installed = self
            .secrets
            .decrypt(secret)
            .and_then(|key| {
                PrivateKeySigner::from_bytes(&key).map_err(|e| {
                    LedgerError::KeyAccess(format!("key material is not a valid secp256k1 key: {}", e))
                })
            })
            .and_then(|signer| {
                let address = signer.address();
                let mut slot = self
                    .signer
                    .write()
                    .map_err(|_| LedgerError::KeyAccess("signer lock poisoned".to_string()))?;
                *slot = Some(signer);
                Ok(address)
            });

        match &installed {
            Ok(address) => {
                self.halted.store(false, Ordering::SeqCst);
                metrics::record_signing_halted(false);
                tracing::info!(address = %address, chain_id = self.chain_id, "Signing key loaded");
            }
            Err(e) => {
                self.halted.store(true, Ordering::SeqCst);
                metrics::record_signing_halted(true);
                tracing::error!(error = %e, "Key access failed, administrative sends halted");
            }
        }
        installed
    }

    /// Operator intervention after a key access failure.
    pub fn reload_key(&self, secret: &SecretRef) -> LedgerResult<Address> {
        tracing::warn!(halted = self.is_halted(), "Reloading signing key");
        self.decrypt_key(secret)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn address(&self) -> Option<Address> {
        self.current_signer().map(|signer| signer.address())
    }

    /// Address of the loaded key, or `KeyAccess` when sends are halted.
    pub fn ensure_ready(&self) -> LedgerResult<Address> {
        if self.is_halted() {
            return Err(LedgerError::KeyAccess(
                "administrative sends halted until the key is reloaded".to_string(),
            ));
        }
        self.address()
            .ok_or_else(|| LedgerError::KeyAccess("no signing key loaded".to_string()))
    }

    fn current_signer(&self) -> Option<PrivateKeySigner> {
        self.signer.read().ok().and_then(|slot| slot.clone())
    }

    /// Build a legacy transaction for `payload`, sign it, and derive its hash.
    pub async fn build_and_sign(
        &self,
        payload: &TransferPayload,
        nonce: u64,
        gas_price: u128,
    ) -> LedgerResult<SignedTransaction> {
        self.ensure_ready()?;
        let signer = self
            .current_signer()
            .ok_or_else(|| LedgerError::KeyAccess("no signing key loaded".to_string()))?;

        let request = TransactionRequest::default()
            .with_from(signer.address())
            .with_to(payload.to())
            .with_value(payload.value())
            .with_input(payload.input())
            .with_nonce(nonce)
            .with_gas_price(gas_price)
            .with_chain_id(self.chain_id)
            .with_gas_limit(self.gas_limit);

        let wallet = EthereumWallet::from(signer);
        let envelope = request
            .build(&wallet)
            .await
            .map_err(|e| LedgerError::InvalidRequest(format!("cannot sign transaction: {}", e)))?;

        let raw = Bytes::from(envelope.encoded_2718());
        let hash = keccak256(&raw);

        tracing::debug!(tx_hash = %hash, nonce = nonce, gas_price = gas_price, "Transaction signed");
        Ok(SignedTransaction { raw, hash })
    }
}

impl std::fmt::Debug for SigningAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningAuthority")
            .field("address", &self.address())
            .field("chain_id", &self.chain_id)
            .field("halted", &self.is_halted())
            .finish()
    }
}
