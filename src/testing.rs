//! In-memory test doubles
//!
//! [`MockTransport`] stands in for the network: connects can be delayed,
//! failed or refused per host, and every stream carries an id so tests can
//! tell connections apart. [`ScriptedOp`] replays a scripted sequence of
//! phase results and records where and when each phase ran.

use crate::core::types::{EndpointKey, OpStatus};
use crate::portal::operation::{OpHeader, Operation, Transport};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A fake connection
#[derive(Debug)]
pub struct MockStream {
    id: u64,
    closed: AtomicBool,
}

impl MockStream {
    /// Unique id of this connection
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once the transport closed it
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct MockState {
    connect_delay: Mutex<Duration>,
    fail_connects: AtomicBool,
    unresolvable: Mutex<HashSet<String>>,
    attempts: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    next_id: AtomicU64,
}

/// Transport double; clones share counters and knobs
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    /// Instant, always-successful connects
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every connect
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.state.connect_delay.lock() = delay;
        self
    }

    /// Make every connect fail with `CantConnect`
    pub fn failing_connects(self) -> Self {
        self.set_fail_connects(true);
        self
    }

    /// Toggle connect failures
    pub fn set_fail_connects(&self, fail: bool) {
        self.state.fail_connects.store(fail, Ordering::Release);
    }

    /// Report `host` as unresolvable
    pub fn unresolvable(self, host: &str) -> Self {
        self.state.unresolvable.lock().insert(host.to_string());
        self
    }

    /// Connect attempts so far, failed ones included
    pub fn connect_attempts(&self) -> usize {
        self.state.attempts.load(Ordering::Acquire)
    }

    /// Successful connects so far
    pub fn connections_opened(&self) -> usize {
        self.state.opened.load(Ordering::Acquire)
    }

    /// Streams closed so far
    pub fn connections_closed(&self) -> usize {
        self.state.closed.load(Ordering::Acquire)
    }
}

impl Transport for MockTransport {
    type Stream = MockStream;
    type Context = ();

    fn resolve(&self, host: &str, _port: u16) -> bool {
        !self.state.unresolvable.lock().contains(host)
    }

    fn connect(
        &self,
        _ctx: &(),
        _host: &str,
        _port: u16,
        _timeout: Duration,
    ) -> Result<MockStream, OpStatus> {
        self.state.attempts.fetch_add(1, Ordering::AcqRel);
        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.state.fail_connects.load(Ordering::Acquire) {
            return Err(OpStatus::CantConnect);
        }
        self.state.opened.fetch_add(1, Ordering::AcqRel);
        Ok(MockStream {
            id: self.state.next_id.fetch_add(1, Ordering::AcqRel) + 1,
            closed: AtomicBool::new(false),
        })
    }

    fn close(&self, stream: &MockStream) {
        if !stream.closed.swap(true, Ordering::AcqRel) {
            self.state.closed.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Which phase an [`Event`] records
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// `send_phase` ran
    Send,
    /// `recv_phase` ran
    Recv,
}

/// One phase execution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    /// Stream the phase ran on
    pub stream: u64,
    /// Operation id
    pub op: u64,
    /// Phase
    pub phase: Phase,
}

/// Log shared between operations
pub type EventLog = Arc<Mutex<Vec<Event>>>;

/// Operation double driven by a script of phase results
pub struct ScriptedOp {
    header: OpHeader<()>,
    /// Caller-chosen id
    pub id: u64,
    send_script: VecDeque<OpStatus>,
    recv_script: VecDeque<OpStatus>,
    send_delay: Duration,
    recv_delay: Duration,
    log: Option<EventLog>,
    /// Streams `recv_phase` ran on, in order
    pub recv_streams: Vec<u64>,
    /// When the operation was last received
    pub received_at: Option<Instant>,
}

impl ScriptedOp {
    /// Operation for `endpoint` with the given workload and retry budget;
    /// every phase succeeds unless scripted otherwise
    pub fn new(endpoint: EndpointKey, id: u64, workload: i64, retries: u32) -> Self {
        Self {
            header: OpHeader::new(endpoint, (), Duration::from_secs(5), workload, retries),
            id,
            send_script: VecDeque::new(),
            recv_script: VecDeque::new(),
            send_delay: Duration::ZERO,
            recv_delay: Duration::ZERO,
            log: None,
            recv_streams: Vec::new(),
            received_at: None,
        }
    }

    /// Results for successive `send_phase` calls
    pub fn with_send_script(mut self, script: impl IntoIterator<Item = OpStatus>) -> Self {
        self.send_script = script.into_iter().collect();
        self
    }

    /// Results for successive `recv_phase` calls
    pub fn with_recv_script(mut self, script: impl IntoIterator<Item = OpStatus>) -> Self {
        self.recv_script = script.into_iter().collect();
        self
    }

    /// Sleep this long at the start of every `send_phase`
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Sleep this long in every `recv_phase`
    pub fn with_recv_delay(mut self, delay: Duration) -> Self {
        self.recv_delay = delay;
        self
    }

    /// Record phases into `log`
    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Set the ordering key
    pub fn with_ordering(mut self, ordering: i64) -> Self {
        self.header.ordering = ordering;
        self
    }

    fn record(&self, stream: &MockStream, phase: Phase) {
        if let Some(log) = &self.log {
            log.lock().push(Event {
                stream: stream.id(),
                op: self.id,
                phase,
            });
        }
    }
}

impl Operation<MockStream, ()> for ScriptedOp {
    fn header(&self) -> &OpHeader<()> {
        &self.header
    }

    fn header_mut(&mut self) -> &mut OpHeader<()> {
        &mut self.header
    }

    fn send_phase(&mut self, stream: &MockStream) -> OpStatus {
        if !self.send_delay.is_zero() {
            thread::sleep(self.send_delay);
        }
        // Closed while writing
        if stream.is_closed() {
            return OpStatus::RetryDeadSocket;
        }
        self.record(stream, Phase::Send);
        self.send_script.pop_front().unwrap_or(OpStatus::Ok)
    }

    fn recv_phase(&mut self, stream: &MockStream) -> OpStatus {
        if !self.recv_delay.is_zero() {
            thread::sleep(self.recv_delay);
        }
        self.recv_streams.push(stream.id());
        self.received_at = Some(Instant::now());
        self.record(stream, Phase::Recv);
        self.recv_script.pop_front().unwrap_or(OpStatus::Ok)
    }
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
