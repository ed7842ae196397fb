//! Prometheus metrics for vault operations
//!
//! Features:
//! - Operation counters by outcome (ok, duplicate, full, invalid, ...)
//! - Occupancy gauges (entries, capacity), one series per region name
//!
//! Key ids and secrets are never used as label values.

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref VAULT_OPERATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("shmvault_operations_total", "Total number of vault operations"),
        &["op", "outcome"]
    ).unwrap();

    pub static ref VAULT_ENTRIES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("shmvault_entries", "Number of occupied slots last observed"),
        &["region"]
    ).unwrap();

    pub static ref VAULT_CAPACITY: IntGaugeVec = IntGaugeVec::new(
        Opts::new("shmvault_capacity", "Number of slots in the attached region"),
        &["region"]
    ).unwrap();
}

/// Register all vault metrics with the global registry
pub fn init_metrics() {
    info!("Initializing Prometheus metrics");

    // Already-registered collectors are fine; init may run once per handle.
    METRICS_REGISTRY.register(Box::new(VAULT_OPERATIONS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(VAULT_ENTRIES.clone())).ok();
    METRICS_REGISTRY.register(Box::new(VAULT_CAPACITY.clone())).ok();
}

/// Count one finished operation
pub fn record(op: &str, outcome: &str) {
    VAULT_OPERATIONS.with_label_values(&[op, outcome]).inc();
}

/// Publish the occupancy of `region` last seen under its lock
///
/// Private regions all report as `anonymous`.
pub fn observe_occupancy(region: &str, count: usize, capacity: usize) {
    VAULT_ENTRIES.with_label_values(&[region]).set(count as i64);
    VAULT_CAPACITY.with_label_values(&[region]).set(capacity as i64);
}

/// Drop the occupancy series of a destroyed region
pub fn forget_region(region: &str) {
    VAULT_ENTRIES.remove_label_values(&[region]).ok();
    VAULT_CAPACITY.remove_label_values(&[region]).ok();
}

/// Export metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}
