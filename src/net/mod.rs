//! Production transports

pub mod tcp;

pub use tcp::{status_from_io, TcpOptions, TcpTransport};
