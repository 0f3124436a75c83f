//! Core system types and foundations
//!
//! Error handling, configuration, and the value types shared between the
//! pool machinery and the protocol layer.

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used items
pub use config::{Config, LoggingConfig, PortalConfig};
pub use error::{Error, Result};
pub use types::{EndpointKey, OpStatus};
