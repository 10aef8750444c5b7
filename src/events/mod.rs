//! Contract event subsystem.
//!
//! # Data Flow
//! ```text
//! ledger log stream ──▶ watcher.rs ──▶ checkpoint.rs (monotonic max per network)
//!   (+ backfill from        │
//!    checkpoint to head)    ├──▶ bus.rs (ContractLogObserved)
//!                           └──▶ LogHandler (reconciler: refresh or record the transaction)
//! ```

pub mod bus;
pub mod checkpoint;
pub mod watcher;

pub use bus::{BroadcastBus, LedgerEvent, NotificationBus};
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore};
pub use watcher::{EventWatcher, LogHandler, LogSubscription};
