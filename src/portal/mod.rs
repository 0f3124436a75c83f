//! Connection-pool scheduler
//!
//! Operations are submitted to a [`PortalContext`], which routes them to a
//! per-endpoint pool. Each pool sizes its set of pipelined connections to
//! the queued workload and recovers from connection failures by requeueing
//! in-flight work.

pub mod completion;
mod connection;
mod context;
mod host;
pub mod operation;
pub mod scaling;

pub use completion::{completion_channel, ChannelSink, Completed, CompletionReceiver};
pub use context::PortalContext;
pub use host::HostStats;
pub use operation::{CompletionSink, OpHeader, Operation, Placement, QueuedOp, Transport};
