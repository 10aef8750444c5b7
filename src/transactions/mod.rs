//! Transaction lifecycle: records, durability, nonces, submission and reconciliation.

pub mod dispatcher;
pub mod memory;
pub mod nonce;
pub mod reconciler;
pub mod record;
pub mod store;

pub use dispatcher::Dispatcher;
pub use memory::MemoryTransactionStore;
pub use nonce::{NonceAllocator, NonceLease};
pub use reconciler::{Reconciler, SweepReport};
pub use record::{TransactionRecord, TransactionState};
pub use store::TransactionStore;
