//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → KeeperConfig (validated, immutable)
//!     → sections handed to each component at construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Secrets are referenced by environment variable name, never inlined

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    KeeperConfig, LedgerConfig, ObservabilityConfig, SecretSource, StorageConfig,
    TransactionConfig, WalletConfig,
};
