//! Resilience helpers.
//!
//! Connection establishment retries on a fixed interval; resubscription after
//! repeated failures backs off exponentially (backoff.rs).

pub mod backoff;
