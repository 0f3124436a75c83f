//! Capability seams between the pool and the protocol layer
//!
//! A [`Transport`] knows how to open and close connections, an
//! [`Operation`] knows how to drive one request/response exchange over an
//! open connection, and a [`CompletionSink`] is told the terminal outcome.

use crate::core::types::{EndpointKey, OpStatus};
use crate::system::metrics::PortalMetrics;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connection factory for one wire transport
pub trait Transport: Send + Sync + 'static {
    /// An open connection, shared by a sender and a receiver thread
    type Stream: Send + Sync + 'static;

    /// Per-endpoint connect parameters carried by operations
    type Context: Clone + Send + Sync + 'static;

    /// Whether `host` can be resolved at all
    fn resolve(&self, host: &str, port: u16) -> bool;

    /// Open a connection to `host:port`
    fn connect(
        &self,
        ctx: &Self::Context,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self::Stream, OpStatus>;

    /// Close a connection; blocked reads and writes on it must return
    fn close(&self, stream: &Self::Stream);
}

/// One protocol exchange, driven in three phases over a stream of type `S`.
///
/// `send_command` and `send_phase` run on the connection's sender thread,
/// `recv_phase` later on its receiver thread. Anything other than
/// [`OpStatus::Ok`] from a send phase tears the connection down.
pub trait Operation<S, C>: Send + 'static {
    /// Scheduling metadata
    fn header(&self) -> &OpHeader<C>;

    /// Mutable scheduling metadata
    fn header_mut(&mut self) -> &mut OpHeader<C>;

    /// Write the command preamble
    fn send_command(&mut self, _stream: &S) -> OpStatus {
        OpStatus::Ok
    }

    /// Write the request payload
    fn send_phase(&mut self, stream: &S) -> OpStatus;

    /// Read the response
    fn recv_phase(&mut self, stream: &S) -> OpStatus;
}

/// Scheduling metadata every operation carries
#[derive(Clone, Debug)]
pub struct OpHeader<C> {
    /// Endpoint the operation targets
    pub endpoint: EndpointKey,
    /// Connect parameters, captured by the pool created for the endpoint
    pub connect_context: C,
    /// Sort key for [`Placement::Ordered`] insertion
    pub ordering: i64,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Workload cost used for admission control
    pub workload: i64,
    /// Remaining retries after a connection-level failure
    pub retries_left: u32,
    /// First time the operation was put on the wire
    pub started_at: Option<Instant>,
    /// Deadline of the current phase
    pub deadline: Option<Instant>,
}

impl<C> OpHeader<C> {
    /// Create a header
    pub fn new(
        endpoint: EndpointKey,
        connect_context: C,
        timeout: Duration,
        workload: i64,
        retries: u32,
    ) -> Self {
        Self {
            endpoint,
            connect_context,
            ordering: 0,
            timeout,
            workload,
            retries_left: retries,
            started_at: None,
            deadline: None,
        }
    }

    /// Set the ordering key
    pub fn with_ordering(mut self, ordering: i64) -> Self {
        self.ordering = ordering;
        self
    }

    /// Start the clock for a phase: `deadline = now + timeout`
    pub fn arm(&mut self, now: Instant) {
        self.started_at.get_or_insert(now);
        self.deadline = Some(now + self.timeout);
    }

    /// True once the current phase deadline has passed
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |d| now >= d)
    }

    /// Time left before the current deadline, or the full timeout if unarmed
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.deadline {
            Some(d) => d.saturating_duration_since(now),
            None => self.timeout,
        }
    }

    /// Spend one retry; false if the budget is exhausted
    pub fn consume_retry(&mut self) -> bool {
        if self.retries_left > 0 {
            self.retries_left -= 1;
            true
        } else {
            false
        }
    }
}

/// Receives the terminal status of every submitted operation, exactly once
pub trait CompletionSink<O>: Send + Sync {
    /// Report `op` as finished with `status`
    fn mark_completed(&self, op: O, status: OpStatus);
}

impl<O, F> CompletionSink<O> for F
where
    F: Fn(O, OpStatus) + Send + Sync,
{
    fn mark_completed(&self, op: O, status: OpStatus) {
        self(op, status)
    }
}

/// Where a submission lands in a pending queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Ahead of everything else
    Front,
    /// Behind everything else
    Back,
    /// Before the first entry with a larger ordering key
    Ordered,
}

/// An operation paired with the sink that will learn its fate
pub struct QueuedOp<O> {
    pub(crate) op: O,
    sink: Arc<dyn CompletionSink<O>>,
}

impl<O> QueuedOp<O> {
    /// Pair `op` with `sink`
    pub fn new(op: O, sink: Arc<dyn CompletionSink<O>>) -> Self {
        Self { op, sink }
    }

    /// The wrapped operation
    pub fn op(&self) -> &O {
        &self.op
    }

    /// Deliver the terminal status, consuming the entry
    pub fn complete(self, status: OpStatus) {
        let metrics = &PortalMetrics::global().operations;
        if status.is_ok() {
            metrics.completed.inc();
        } else {
            metrics.failed.inc();
        }
        self.sink.mark_completed(self.op, status);
    }
}

impl<O: fmt::Debug> fmt::Debug for QueuedOp<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOp").field("op", &self.op).finish()
    }
}
