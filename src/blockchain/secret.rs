//! Access to the administrative key material.
//!
//! # Security
//! - Keys come from an environment variable or an encrypted keystore, never the config file
//! - Decrypted bytes are handed straight to the signing authority and never logged

use std::path::PathBuf;

use alloy::primitives::B256;
use alloy::signers::local::PrivateKeySigner;

use crate::blockchain::types::{LedgerError, LedgerResult};
use crate::config::schema::{SecretSource, WalletConfig};

/// Where the key material lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretRef {
    /// Hex private key in this environment variable.
    EnvVar(String),
    /// Encrypted JSON keystore; the passphrase is read from `passphrase_env_var`.
    Keystore {
        path: PathBuf,
        passphrase_env_var: String,
    },
}

impl SecretRef {
    pub fn from_config(config: &WalletConfig) -> LedgerResult<Self> {
        match config.source {
            SecretSource::Env => Ok(SecretRef::EnvVar(config.key_env_var.clone())),
            SecretSource::Keystore => {
                let path = config.keystore_path.as_ref().ok_or_else(|| {
                    LedgerError::KeyAccess("keystore path not configured".to_string())
                })?;
                Ok(SecretRef::Keystore {
                    path: PathBuf::from(path),
                    passphrase_env_var: config.passphrase_env_var.clone(),
                })
            }
        }
    }
}

/// Decrypts key material for the signing authority.
pub trait SecretAccess: Send + Sync {
    fn decrypt(&self, secret: &SecretRef) -> LedgerResult<B256>;
}

/// Reads keys from the local process environment and filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSecretAccess;

impl SecretAccess for LocalSecretAccess {
    fn decrypt(&self, secret: &SecretRef) -> LedgerResult<B256> {
        match secret {
            SecretRef::EnvVar(var) => {
                let raw = read_env(var)?;
                parse_private_key(&raw)
            }
            SecretRef::Keystore {
                path,
                passphrase_env_var,
            } => {
                let passphrase = read_env(passphrase_env_var)?;
                let signer = PrivateKeySigner::decrypt_keystore(path, passphrase).map_err(|e| {
                    LedgerError::KeyAccess(format!(
                        "cannot decrypt keystore {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(signer.to_bytes())
            }
        }
    }
}

fn read_env(var: &str) -> LedgerResult<String> {
    std::env::var(var)
        .map_err(|_| LedgerError::KeyAccess(format!("Environment variable {} not set", var)))
}

/// Parse a hex private key, with or without `0x` prefix.
pub fn parse_private_key(raw: &str) -> LedgerResult<B256> {
    let trimmed = raw.trim();
    let key_hex = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let key: B256 = key_hex
        .parse()
        .map_err(|e| LedgerError::KeyAccess(format!("Invalid private key format: {}", e)))?;
    if key == B256::ZERO {
        return Err(LedgerError::KeyAccess("private key is zero".to_string()));
    }
    Ok(key)
}
