//! Host Portal - adaptive connection pools for pipelined remote-storage clients
//!
//! Every remote endpoint gets its own pool of network connections. Each
//! connection is a pipeline: a sender thread writes queued operations while
//! a receiver thread reads their responses in send order. Pools grow with
//! queued workload, back off after failures, close idle connections and
//! stay within a process-wide connection budget.
#![warn(missing_docs)]

// Core foundational modules
pub mod core;

// Main functional modules
pub mod net;
pub mod portal;
pub mod system;

// Test doubles for integration tests and benches; not part of the supported API
#[doc(hidden)]
pub mod testing;

// Re-export commonly used items for convenience
pub use crate::core::{Config, EndpointKey, Error, LoggingConfig, OpStatus, PortalConfig, Result};
pub use crate::portal::{
    completion_channel, CompletionSink, HostStats, OpHeader, Operation, Placement, PortalContext,
    Transport,
};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Install the tracing subscriber and register metrics.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already installed.
pub fn init(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&logging.level))
        .map_err(|e| Error::config(format!("Invalid log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(logging.thread_names);

    let installed = match logging.format.as_str() {
        "compact" => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| Error::internal(format!("Failed to install subscriber: {}", e)))?;

    tracing::info!("Initializing {} v{}", NAME, VERSION);

    system::metrics::init_registry();

    Ok(())
}
