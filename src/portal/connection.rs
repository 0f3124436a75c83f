//! Connection pipeline
//!
//! One transport connection driven by a sender thread and a receiver
//! thread. The sender pulls from the pool queue and writes; the receiver
//! reads responses strictly in send order, and on exit tears the connection
//! down, requeues survivors and parks itself on the pool's reap list.

use crate::core::error::{Error, Result};
use crate::core::types::OpStatus;
use crate::portal::host::HostPortal;
use crate::portal::operation::{Operation, Placement, QueuedOp, Transport};
use crate::system::metrics::PortalMetrics;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on any single wait, so idle and shutdown checks re-run
const MAX_WAIT: Duration = Duration::from_secs(1);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ConnState<T: Transport, O> {
    stream: Option<Arc<T::Stream>>,
    /// Sent, awaiting their response, oldest first
    pending: VecDeque<QueuedOp<O>>,
    /// Workload of everything between dequeue and response
    workload: i64,
    shutdown: bool,
    last_used: Instant,
    started: bool,
    aborted: bool,
    connected: bool,
    /// Sender holds an op it has dequeued but not yet handed over
    sending: bool,
    /// Receiver holds an op it has popped but not yet finished
    receiving: bool,
    /// Op whose send failed, left for teardown
    mid_send: Option<(QueuedOp<O>, OpStatus)>,
    cmds_at_start: u64,
    cmd_count: u64,
    exited: bool,
}

#[derive(Default)]
struct Threads {
    sender: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
    receiver_id: Option<ThreadId>,
}

pub(crate) struct HostConnection<T: Transport, O> {
    pub(crate) id: u64,
    portal: Arc<HostPortal<T, O>>,
    state: Mutex<ConnState<T, O>>,
    send_cond: Condvar,
    recv_cond: Condvar,
    exit_cond: Condvar,
    threads: Mutex<Threads>,
}

impl<T, O> HostConnection<T, O>
where
    T: Transport,
    O: Operation<T::Stream, T::Context>,
{
    /// Start the sender/receiver pair for a connection already counted in
    /// the pool's `n_conn`.
    pub(crate) fn spawn(portal: &Arc<HostPortal<T, O>>) -> Result<Arc<Self>> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Self {
            id,
            portal: portal.clone(),
            state: Mutex::new(ConnState {
                stream: None,
                pending: VecDeque::new(),
                workload: 0,
                shutdown: false,
                last_used: Instant::now(),
                started: false,
                aborted: false,
                connected: false,
                sending: false,
                receiving: false,
                mid_send: None,
                cmds_at_start: 0,
                cmd_count: 0,
                exited: false,
            }),
            send_cond: Condvar::new(),
            recv_cond: Condvar::new(),
            exit_cond: Condvar::new(),
            threads: Mutex::new(Threads::default()),
        });

        let mut threads = conn.threads.lock();

        let sender = {
            let conn = conn.clone();
            thread::Builder::new()
                .name(format!("hp-send-{}", id))
                .spawn(move || conn.sender_loop())
                .map_err(Error::Spawn)?
        };
        threads.sender = Some(sender);

        let receiver = {
            let c = conn.clone();
            thread::Builder::new()
                .name(format!("hp-recv-{}", id))
                .spawn(move || c.receiver_loop())
        };
        let receiver = match receiver {
            Ok(h) => h,
            Err(e) => {
                conn.state.lock().aborted = true;
                conn.send_cond.notify_all();
                if let Some(h) = threads.sender.take() {
                    let _ = h.join();
                }
                return Err(Error::Spawn(e));
            }
        };
        threads.receiver_id = Some(receiver.thread().id());
        threads.receiver = Some(receiver);
        drop(threads);

        portal.ctx.adjust_running_threads(1);
        conn.state.lock().started = true;
        conn.send_cond.notify_all();
        conn.recv_cond.notify_all();

        debug!(host = %portal.key, conn = id, "connection spawned");
        Ok(conn)
    }

    fn wait_started(&self, cond: &Condvar) -> bool {
        let mut state = self.state.lock();
        while !state.started && !state.aborted {
            cond.wait_for(&mut state, MAX_WAIT);
        }
        state.started
    }

    /// True if nothing is in flight. Never blocks; a contended lock reads as busy.
    pub(crate) fn try_is_idle(&self) -> bool {
        self.state.try_lock().map_or(false, |s| {
            !s.shutdown && s.pending.is_empty() && !s.sending && !s.receiving && s.workload == 0
        })
    }

    /// Workload and last use, for eviction scans; `None` once shutting down
    pub(crate) fn load(&self) -> Option<(i64, Instant)> {
        let s = self.state.lock();
        if s.shutdown {
            None
        } else {
            Some((s.workload, s.last_used))
        }
    }

    /// Ask both threads to wind down, the same way an idle close does
    pub(crate) fn request_shutdown(&self) {
        self.state.lock().shutdown = true;
        self.send_cond.notify_all();
        self.recv_cond.notify_all();
        self.portal.cond.notify_all();
    }

    /// Request shutdown and wait for the receiver to finish teardown
    pub(crate) fn close(&self) {
        self.request_shutdown();
        self.join();
    }

    /// Wait for the receiver thread to exit. A no-op on the receiver itself.
    pub(crate) fn join(&self) {
        let handle = {
            let mut threads = self.threads.lock();
            if threads.receiver_id == Some(thread::current().id()) {
                return;
            }
            threads.receiver.take()
        };

        match handle {
            Some(h) => {
                if h.join().is_err() {
                    error!(host = %self.portal.key, conn = self.id, "receiver thread panicked");
                }
            }
            None => {
                // Someone else is joining it.
                let mut state = self.state.lock();
                while !state.exited {
                    self.exit_cond.wait_for(&mut state, MAX_WAIT);
                }
            }
        }
    }

    fn sender_loop(self: Arc<Self>) {
        if !self.wait_started(&self.send_cond) {
            return;
        }

        let portal = &self.portal;
        let ctx = &portal.ctx;
        let cfg = &ctx.config;

        let (invalid_host, cmds_at_start) = {
            let state = portal.state.lock();
            (state.invalid_host, state.cmds_processed)
        };
        self.state.lock().cmds_at_start = cmds_at_start;

        let stream = if invalid_host {
            warn!(host = %portal.key, conn = self.id, "invalid host, emptying queue");
            portal.fail_tasks(OpStatus::InvalidHost);
            None
        } else {
            match ctx.transport.connect(
                &portal.connect_context,
                portal.key.host(),
                portal.key.port(),
                cfg.connect_timeout,
            ) {
                Ok(stream) => Some(Arc::new(stream)),
                Err(status) => {
                    warn!(host = %portal.key, conn = self.id, %status, "can't connect");
                    PortalMetrics::global().connections.connect_failures.inc();
                    None
                }
            }
        };
        let connected = stream.is_some();

        let closing = {
            let mut state = portal.state.lock();
            if connected {
                state.successful_attempts += 1;
                state.failed_attempts = 0;
            } else {
                state.failed_attempts += 1;
            }
            state.conns.insert(self.id, self.clone());
            state.closing
        };

        {
            let mut state = self.state.lock();
            state.stream = stream.clone();
            state.connected = connected;
            state.last_used = Instant::now();
            if closing || !connected {
                state.shutdown = true;
            }
        }

        let mut mid_send = None;
        if let Some(stream) = stream {
            info!(host = %portal.key, conn = self.id, "connected");
            PortalMetrics::global().connections.opened.inc();
            mid_send = self.send_loop(&stream);
        }

        {
            let mut state = self.state.lock();
            state.mid_send = mid_send;
            state.sending = false;
            state.shutdown = true;
        }
        self.recv_cond.notify_all();
        ctx.adjust_running_threads(-1);
        debug!(host = %portal.key, conn = self.id, "sender exiting");
    }

    /// Active phase of the sender. Returns the op it was holding if a send
    /// failed.
    fn send_loop(&self, stream: &T::Stream) -> Option<(QueuedOp<O>, OpStatus)> {
        let portal = &self.portal;
        let cfg = &portal.ctx.config;

        loop {
            // Backpressure: wait for the receiver to drain below the limit.
            let last_used = {
                let mut state = self.state.lock();
                while state.workload > cfg.max_workload && !state.shutdown {
                    self.send_cond.wait_for(&mut state, MAX_WAIT);
                }
                if state.shutdown {
                    return None;
                }
                state.last_used
            };

            let next = {
                let mut pstate = portal.state.lock();
                match pstate.dequeue_next() {
                    Some(q) => {
                        self.state.lock().sending = true;
                        Some(q)
                    }
                    None => {
                        self.send_cond.notify_all();
                        let idle_left = cfg.min_idle.saturating_sub(last_used.elapsed());
                        if !idle_left.is_zero() {
                            portal.cond.wait_for(&mut pstate, idle_left.min(MAX_WAIT));
                        }
                        None
                    }
                }
            };

            if let Some(mut q) = next {
                let status = self.send_one(&mut q, stream);
                if !status.is_ok() {
                    debug!(host = %portal.key, conn = self.id, %status, "send failed");
                    return Some((q, status));
                }
                {
                    let mut state = self.state.lock();
                    state.pending.push_back(q);
                    state.sending = false;
                }
                self.recv_cond.notify_all();
            }

            let state = self.state.lock();
            if state.shutdown {
                return None;
            }
            if state.pending.is_empty()
                && !state.receiving
                && state.last_used.elapsed() >= cfg.min_idle
            {
                debug!(host = %portal.key, conn = self.id, "idle, closing");
                return None;
            }
        }
    }

    fn send_one(&self, q: &mut QueuedOp<O>, stream: &T::Stream) -> OpStatus {
        q.op.header_mut().arm(Instant::now());
        let status = q.op.send_command(stream);
        if !status.is_ok() {
            return status;
        }
        {
            let mut state = self.state.lock();
            state.last_used = Instant::now();
            state.workload += q.op.header().workload;
        }
        q.op.send_phase(stream)
    }

    fn receiver_loop(self: Arc<Self>) {
        if !self.wait_started(&self.recv_cond) {
            return;
        }

        let portal = &self.portal;
        let check_interval = portal.ctx.config.check_interval;
        let mut next_check = Instant::now() + check_interval;
        let mut held = None;

        loop {
            let now = Instant::now();
            if now >= next_check {
                portal.rescale();
                next_check = now + check_interval;
            }

            let mut state = self.state.lock();
            let Some(mut q) = state.pending.pop_front() else {
                // A send in progress still hands its op over; closing under it
                // would fail an op that never faulted.
                if state.shutdown && !state.sending {
                    break;
                }
                let wait = next_check.saturating_duration_since(Instant::now());
                self.recv_cond.wait_for(&mut state, wait.min(MAX_WAIT));
                continue;
            };
            state.receiving = true;
            let stream = state.stream.clone();
            drop(state);

            let status = match &stream {
                Some(stream) => {
                    q.op.header_mut().arm(Instant::now());
                    q.op.recv_phase(stream)
                }
                None => OpStatus::DeadConnection,
            };

            {
                let mut state = self.state.lock();
                state.receiving = false;
                state.workload -= q.op.header().workload;
            }
            self.send_cond.notify_all();

            match status {
                OpStatus::RetryDeadSocket => {
                    debug!(host = %portal.key, conn = self.id, "dead socket");
                    held = Some((q, status));
                    break;
                }
                OpStatus::Timeout if q.op.header().retries_left > 0 => {
                    debug!(
                        host = %portal.key,
                        conn = self.id,
                        retries_left = q.op.header().retries_left,
                        "timed out, retrying elsewhere"
                    );
                    held = Some((q, status));
                    break;
                }
                _ => {
                    self.state.lock().cmd_count += 1;
                    portal.state.lock().cmds_processed += 1;
                    q.complete(status);
                }
            }
        }

        self.finish(held);
    }

    /// Receiver-side teardown
    fn finish(self: &Arc<Self>, held: Option<(QueuedOp<O>, OpStatus)>) {
        let portal = &self.portal;
        let ctx = &portal.ctx;
        let cfg = &ctx.config;

        let stream = {
            let mut state = self.state.lock();
            state.workload = 0;
            state.shutdown = true;
            state.stream.take()
        };
        if let Some(stream) = stream {
            ctx.transport.close(&stream);
        }
        self.send_cond.notify_all();
        self.recv_cond.notify_all();
        portal.cond.notify_all();

        let sender = self.threads.lock().sender.take();
        if let Some(h) = sender {
            if h.join().is_err() {
                error!(host = %portal.key, conn = self.id, "sender thread panicked");
            }
        }

        let (connected, cmds_at_start, cmd_count, mid_send, pending) = {
            let mut state = self.state.lock();
            (
                state.connected,
                state.cmds_at_start,
                state.cmd_count,
                state.mid_send.take(),
                mem::take(&mut state.pending),
            )
        };

        if !connected {
            let abort = {
                let pstate = portal.state.lock();
                !pstate.invalid_host
                    && pstate.cmds_processed == cmds_at_start
                    && pstate.failed_attempts >= cfg.abort_conn_attempts
            };
            if abort {
                error!(
                    host = %portal.key,
                    conn = self.id,
                    attempts = cfg.abort_conn_attempts,
                    "giving up on endpoint"
                );
                portal.fail_tasks(OpStatus::CantConnect);
            }
        }

        // Retry order: what the receiver held, then in-flight oldest
        // first, then what the sender held.
        let mut survivors = Vec::new();
        let mut terminal = Vec::new();
        for (mut q, status) in held.into_iter() {
            if q.op.header_mut().consume_retry() {
                survivors.push(q);
            } else {
                terminal.push((q, status));
            }
        }
        survivors.extend(pending);
        for (mut q, status) in mid_send.into_iter() {
            if q.op.header_mut().consume_retry() {
                survivors.push(q);
            } else {
                terminal.push((q, status));
            }
        }

        let mut requeued = 0;
        {
            let mut pstate = portal.state.lock();
            if pstate.closing {
                terminal.extend(survivors.into_iter().map(|q| (q, OpStatus::DeadConnection)));
            } else {
                requeued = survivors.len();
                for q in survivors.into_iter().rev() {
                    pstate.push(q, Placement::Front);
                }
                if requeued > 0 {
                    let n_conn = pstate.n_conn.saturating_sub(1);
                    pstate.ratchet.destabilize(n_conn, cfg.wait_stable_time, Instant::now());
                }
            }
            pstate.n_conn = pstate.n_conn.saturating_sub(1);
            pstate.conns.remove(&self.id);
            pstate.closed.push(self.clone());
        }
        portal.cond.notify_all();

        for (q, status) in terminal {
            q.complete(status);
        }

        let metrics = PortalMetrics::global();
        metrics.connections.closed.inc();
        if requeued > 0 {
            metrics.operations.requeued.inc_by(requeued as u64);
        }
        info!(
            host = %portal.key,
            conn = self.id,
            commands = cmd_count,
            requeued,
            "connection closed"
        );

        portal.rescale();

        self.state.lock().exited = true;
        self.exit_cond.notify_all();
    }
}
