//! Endpoint pool
//!
//! Per-endpoint pending queue plus the connections draining it. The pool
//! lock guards everything in [`PortalState`]; connections take it before
//! their own lock, never after.

use crate::core::types::{EndpointKey, OpStatus};
use crate::portal::connection::HostConnection;
use crate::portal::context::Inner;
use crate::portal::operation::{Operation, Placement, QueuedOp, Transport};
use crate::portal::scaling::{self, Ratchet, ScaleInput};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Point-in-time view of one endpoint pool
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Connections registered in the live list
    pub connections: usize,
    /// Connections counted against the pool, including ones still connecting
    pub reserved: usize,
    /// Operations waiting in the pending queue
    pub pending_ops: usize,
    /// Workload of the pending queue
    pub pending_workload: i64,
    /// Current stable target
    pub stable_target: usize,
    /// Operations completed by this pool's connections
    pub cmds_processed: u64,
    /// Consecutive failed connects
    pub failed_connects: u32,
    /// Successful connects
    pub successful_connects: u32,
    /// Closed connections waiting to be reaped
    pub closed_unreaped: usize,
    /// Dedicated single-connection sub-pools
    pub dedicated_pools: usize,
    /// Host failed to resolve
    pub invalid_host: bool,
}

pub(crate) struct PortalState<T: Transport, O> {
    pub(crate) queue: VecDeque<QueuedOp<O>>,
    pub(crate) workload: i64,
    pub(crate) n_conn: usize,
    pub(crate) ratchet: Ratchet,
    pub(crate) cmds_processed: u64,
    pub(crate) failed_attempts: u32,
    pub(crate) successful_attempts: u32,
    pub(crate) invalid_host: bool,
    pub(crate) conns: BTreeMap<u64, Arc<HostConnection<T, O>>>,
    pub(crate) closed: Vec<Arc<HostConnection<T, O>>>,
    pub(crate) sync_list: Vec<Arc<HostPortal<T, O>>>,
    /// Shutting down: nothing is requeued or spawned
    pub(crate) closing: bool,
    /// Detached from its registry; submitters must look up again
    pub(crate) retired: bool,
}

impl<T: Transport, O> PortalState<T, O> {
    /// Nothing running, queued, pending reap or hanging off this pool
    pub(crate) fn is_idle(&self) -> bool {
        self.n_conn == 0 && self.queue.is_empty() && self.sync_list.is_empty() && self.closed.is_empty()
    }
}

impl<T, O> PortalState<T, O>
where
    T: Transport,
    O: Operation<T::Stream, T::Context>,
{
    pub(crate) fn push(&mut self, q: QueuedOp<O>, placement: Placement) {
        self.workload += q.op.header().workload;
        match placement {
            Placement::Front => self.queue.push_front(q),
            Placement::Back => self.queue.push_back(q),
            Placement::Ordered => {
                let key = q.op.header().ordering;
                let at = self
                    .queue
                    .iter()
                    .position(|e| e.op.header().ordering > key)
                    .unwrap_or(self.queue.len());
                self.queue.insert(at, q);
            }
        }
    }

    /// Pop the next operation; the caller holds the pool lock
    pub(crate) fn dequeue_next(&mut self) -> Option<QueuedOp<O>> {
        let q = self.queue.pop_front()?;
        self.workload -= q.op.header().workload;
        Some(q)
    }

    fn drain(&mut self) -> Vec<QueuedOp<O>> {
        self.workload = 0;
        self.queue.drain(..).collect()
    }
}

/// One endpoint's pool of connections
pub(crate) struct HostPortal<T: Transport, O> {
    pub(crate) key: EndpointKey,
    pub(crate) connect_context: T::Context,
    pub(crate) min_conn: usize,
    pub(crate) max_conn: usize,
    pub(crate) ctx: Arc<Inner<T, O>>,
    pub(crate) state: Mutex<PortalState<T, O>>,
    /// Signalled when work is queued or a connection leaves
    pub(crate) cond: Condvar,
}

impl<T, O> HostPortal<T, O>
where
    T: Transport,
    O: Operation<T::Stream, T::Context>,
{
    pub(crate) fn new(
        ctx: Arc<Inner<T, O>>,
        key: EndpointKey,
        connect_context: T::Context,
        min_conn: usize,
        max_conn: usize,
        invalid_host: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            connect_context,
            min_conn,
            max_conn,
            ctx,
            state: Mutex::new(PortalState {
                queue: VecDeque::new(),
                workload: 0,
                n_conn: 0,
                ratchet: Ratchet::new(max_conn),
                cmds_processed: 0,
                failed_attempts: 0,
                successful_attempts: 0,
                invalid_host,
                conns: BTreeMap::new(),
                closed: Vec::new(),
                sync_list: Vec::new(),
                closing: false,
                retired: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// Queue `q` and scale up if needed. Hands the op back if the pool has
    /// been retired in the meantime.
    pub(crate) fn submit(self: &Arc<Self>, q: QueuedOp<O>, placement: Placement) -> Result<(), QueuedOp<O>> {
        {
            let mut state = self.state.lock();
            if state.retired {
                return Err(q);
            }
            self.enqueue_locked(&mut state, q, placement);
        }
        self.rescale();
        Ok(())
    }

    pub(crate) fn enqueue_locked(&self, state: &mut PortalState<T, O>, q: QueuedOp<O>, placement: Placement) {
        debug!(host = %self.key, workload = q.op.header().workload, ?placement, "enqueue");
        state.push(q, placement);
        self.cond.notify_all();
    }

    /// Run the scaling policy and open whatever it asks for
    pub(crate) fn rescale(self: &Arc<Self>) {
        let cfg = &self.ctx.config;
        let n_new = {
            let mut state = self.state.lock();
            if state.closing {
                return;
            }
            let input = ScaleInput {
                queued: state.queue.len(),
                workload: state.workload,
                n_conn: state.n_conn,
                min_conn: self.min_conn,
                max_conn: self.max_conn,
                max_workload: cfg.max_workload,
                invalid_host: state.invalid_host,
            };
            let n_new = scaling::plan(&input, &mut state.ratchet, cfg.wait_stable_time, Instant::now());
            if n_new > 0 {
                debug!(
                    host = %self.key,
                    n_conn = state.n_conn,
                    workload = state.workload,
                    new_conn = n_new,
                    stable = state.ratchet.stable_conn,
                    "scaling up"
                );
            }
            // Reserve before spawning so concurrent rescales see them.
            state.n_conn += n_new;
            n_new
        };

        for _ in 0..n_new {
            self.spawn_connection();
        }
    }

    fn spawn_connection(self: &Arc<Self>) {
        if self.ctx.running_threads() >= self.ctx.config.max_connections {
            self.ctx.evict_one();
        }

        if let Err(e) = HostConnection::spawn(self) {
            error!(host = %self.key, error = %e, "failed to start connection");
            let orphaned = {
                let mut state = self.state.lock();
                state.n_conn = state.n_conn.saturating_sub(1);
                if state.n_conn == 0 {
                    state.drain()
                } else {
                    Vec::new()
                }
            };
            for q in orphaned {
                q.complete(OpStatus::Generic);
            }
        }
    }

    /// Complete everything queued with `status`
    pub(crate) fn fail_tasks(&self, status: OpStatus) {
        let failed = self.state.lock().drain();
        if !failed.is_empty() {
            error!(host = %self.key, count = failed.len(), %status, "failing queued operations");
        }
        for q in failed {
            q.complete(status);
        }
    }

    /// Join connections that have removed themselves. Must not be called
    /// with any lock held.
    pub(crate) fn reap(&self) {
        let closed = mem::take(&mut self.state.lock().closed);
        for conn in closed {
            conn.join();
        }
    }

    /// Reap sub-pools and drop the idle ones
    pub(crate) fn compact_dedicated(&self) {
        let subs = self.state.lock().sync_list.clone();
        if subs.is_empty() {
            return;
        }
        for sub in &subs {
            sub.reap();
        }

        let mut state = self.state.lock();
        state.sync_list.retain(|sub| {
            let mut s = sub.state.lock();
            if s.is_idle() {
                s.retired = true;
                false
            } else {
                true
            }
        });
    }

    /// True if a dedicated caller can have this sub-pool right now.
    /// `state` is this pool's own locked state.
    pub(crate) fn accepts_dedicated(&self, state: &PortalState<T, O>) -> bool {
        if state.retired || state.closing || !state.queue.is_empty() {
            return false;
        }
        match (state.n_conn, state.conns.values().next()) {
            (0, _) => true,
            (1, Some(conn)) if state.conns.len() == 1 => conn.try_is_idle(),
            _ => false,
        }
    }

    /// Tear the pool down: fail queued work, close every connection and
    /// wait for all of them to leave.
    pub(crate) fn shutdown(&self) {
        let (drained, subs) = {
            let mut state = self.state.lock();
            state.closing = true;
            state.retired = true;
            (state.drain(), mem::take(&mut state.sync_list))
        };
        for q in drained {
            q.complete(OpStatus::Generic);
        }
        for sub in subs {
            sub.shutdown();
        }

        loop {
            let live: Vec<_> = {
                let mut state = self.state.lock();
                if state.n_conn == 0 {
                    break;
                }
                if state.conns.is_empty() {
                    // Still connecting; they notice `closing` on registration.
                    self.cond.wait_for(&mut state, Duration::from_millis(50));
                    continue;
                }
                state.conns.values().cloned().collect()
            };
            for conn in live {
                conn.close();
            }
        }

        self.reap();
        info!(host = %self.key, "endpoint pool shut down");
    }

    pub(crate) fn stats(&self) -> HostStats {
        let state = self.state.lock();
        HostStats {
            connections: state.conns.len(),
            reserved: state.n_conn,
            pending_ops: state.queue.len(),
            pending_workload: state.workload,
            stable_target: state.ratchet.stable_conn,
            cmds_processed: state.cmds_processed,
            failed_connects: state.failed_attempts,
            successful_connects: state.successful_attempts,
            closed_unreaped: state.closed.len(),
            dedicated_pools: state.sync_list.len(),
            invalid_host: state.invalid_host,
        }
    }
}

impl<T: Transport, O> Drop for HostPortal<T, O> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.queue.is_empty() {
            warn!(host = %self.key, count = state.queue.len(), "endpoint pool dropped with queued operations");
            for q in state.queue.drain(..) {
                q.complete(OpStatus::Generic);
            }
        }
    }
}
