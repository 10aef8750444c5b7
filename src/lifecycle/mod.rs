//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Load snapshots → Decrypt key → Connect → Start loops
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop watching → Cancel loops → Close session → Save snapshots
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
