//! System utilities and monitoring
//!
//! Prometheus instrumentation for pools and connections.

pub mod metrics;
