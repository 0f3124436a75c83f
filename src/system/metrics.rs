//! Metrics collection for the host portal
//!
//! Counters and gauges live in a crate-local Prometheus registry so an
//! embedding application can expose them next to its own.

use crate::core::error::Result;
use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    Registry,
};

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Connection lifecycle counters
pub struct ConnectionMetrics {
    /// Connections that completed a transport connect
    pub opened: IntCounter,
    /// Connection pipelines torn down, for any reason
    pub closed: IntCounter,
    /// Failed transport connect attempts
    pub connect_failures: IntCounter,
    /// Connections closed to make room under the global budget
    pub evictions: IntCounter,
    /// Sender/receiver pairs currently running
    pub running_threads: IntGauge,
}

/// Operation outcome counters
pub struct OperationMetrics {
    /// Operations completed with `Ok`
    pub completed: IntCounter,
    /// Operations completed with any other status
    pub failed: IntCounter,
    /// Operations pushed back onto a pending queue after a connection died
    pub requeued: IntCounter,
}

/// Centralized metrics for the portal
pub struct PortalMetrics {
    /// Connection lifecycle metrics
    pub connections: ConnectionMetrics,
    /// Operation metrics
    pub operations: OperationMetrics,
    /// Endpoint pools currently registered across all contexts
    pub host_portals: IntGauge,
}

impl PortalMetrics {
    /// Create and register a metrics set in `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        Ok(Self {
            connections: ConnectionMetrics::new(registry)?,
            operations: OperationMetrics::new(registry)?,
            host_portals: register_int_gauge_with_registry!(
                "hp_host_portals",
                "Number of endpoint pools currently registered",
                registry
            )?,
        })
    }

    /// Get the global metrics instance
    pub fn global() -> &'static PortalMetrics {
        static INSTANCE: Lazy<PortalMetrics> = Lazy::new(|| {
            PortalMetrics::new(&REGISTRY).expect("Failed to initialize metrics")
        });
        &INSTANCE
    }
}

impl ConnectionMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        Ok(Self {
            opened: register_int_counter_with_registry!(
                "hp_connections_opened_total",
                "Total number of connections established",
                registry
            )?,
            closed: register_int_counter_with_registry!(
                "hp_connections_closed_total",
                "Total number of connections torn down",
                registry
            )?,
            connect_failures: register_int_counter_with_registry!(
                "hp_connect_failures_total",
                "Total number of failed connect attempts",
                registry
            )?,
            evictions: register_int_counter_with_registry!(
                "hp_evictions_total",
                "Total number of connections evicted under the global budget",
                registry
            )?,
            running_threads: register_int_gauge_with_registry!(
                "hp_running_threads",
                "Number of running connection pipelines",
                registry
            )?,
        })
    }
}

impl OperationMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        Ok(Self {
            completed: register_int_counter_with_registry!(
                "hp_ops_completed_total",
                "Total number of operations completed successfully",
                registry
            )?,
            failed: register_int_counter_with_registry!(
                "hp_ops_failed_total",
                "Total number of operations completed with an error status",
                registry
            )?,
            requeued: register_int_counter_with_registry!(
                "hp_ops_requeued_total",
                "Total number of operations requeued after a connection failure",
                registry
            )?,
        })
    }
}

/// Initialize the metrics registry by creating the global metrics instance
pub fn init_registry() {
    let _ = PortalMetrics::global();
}

/// Get the Prometheus registry holding the portal metrics
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Collect and return all metrics as a Prometheus-formatted string
pub fn collect_metrics() -> String {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = registry().gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
