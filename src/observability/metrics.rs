//! Metrics collection and exposition.
//!
//! # Metrics
//! - `ledger_rpc_requests_total` (counter): RPC calls by method and result
//! - `ledger_rpc_duration_seconds` (histogram): RPC latency by method
//! - `ledger_connected` (gauge): 1 while a session is open, 0 otherwise
//! - `ledger_cache_lookups_total` (counter): single-flight lookups by cache and outcome
//! - `ledger_submissions_total` (counter): raw submissions by outcome
//! - `ledger_transitions_total` (counter): record state transitions by target state
//! - `ledger_pending_transactions` (gauge): pending records seen by the last sweep
//! - `ledger_checkpoint_block` (gauge): last watched block number
//! - `ledger_logs_observed_total` (counter): contract logs delivered to the watcher
//! - `ledger_signing_halted` (gauge): 1 while administrative sends are halted

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with its own scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_rpc_call(method: &'static str, elapsed: Duration, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("ledger_rpc_requests_total", "method" => method, "result" => result).increment(1);
    histogram!("ledger_rpc_duration_seconds", "method" => method).record(elapsed.as_secs_f64());
}

pub fn record_connection_state(connected: bool) {
    gauge!("ledger_connected").set(if connected { 1.0 } else { 0.0 });
}

pub fn record_cache_lookup(cache: &'static str, fetched: bool) {
    let outcome = if fetched { "miss" } else { "hit" };
    counter!("ledger_cache_lookups_total", "cache" => cache, "outcome" => outcome).increment(1);
}

pub fn record_submission(outcome: &'static str) {
    counter!("ledger_submissions_total", "outcome" => outcome).increment(1);
}

pub fn record_transition(state: &'static str) {
    counter!("ledger_transitions_total", "state" => state).increment(1);
}

pub fn record_pending_transactions(count: usize) {
    gauge!("ledger_pending_transactions").set(count as f64);
}

pub fn record_checkpoint(block: u64) {
    gauge!("ledger_checkpoint_block").set(block as f64);
}

pub fn record_log_observed() {
    counter!("ledger_logs_observed_total").increment(1);
}

pub fn record_signing_halted(halted: bool) {
    gauge!("ledger_signing_halted").set(if halted { 1.0 } else { 0.0 });
}
