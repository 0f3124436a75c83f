//! Portal context: the endpoint registry
//!
//! Maps endpoint keys to pools, owns the transport and policy, tracks the
//! global connection budget and runs garbage collection.
//!
//! Lock order is registry, pool, sub-pool, connection. Joins happen with no
//! lock held.

use crate::core::config::PortalConfig;
use crate::core::error::{Error, Result};
use crate::core::types::{EndpointKey, OpStatus};
use crate::portal::connection::HostConnection;
use crate::portal::host::{HostPortal, HostStats};
use crate::portal::operation::{CompletionSink, OpHeader, Operation, Placement, QueuedOp, Transport};
use crate::portal::scaling::{self, Victim};
use crate::system::metrics::PortalMetrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct Table<T: Transport, O> {
    pools: HashMap<EndpointKey, Arc<HostPortal<T, O>>>,
    next_check: Instant,
    shut_down: bool,
}

pub(crate) struct Inner<T: Transport, O> {
    pub(crate) transport: T,
    pub(crate) config: PortalConfig,
    table: Mutex<Table<T, O>>,
    running: AtomicUsize,
}

impl<T, O> Inner<T, O>
where
    T: Transport,
    O: Operation<T::Stream, T::Context>,
{
    pub(crate) fn running_threads(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn adjust_running_threads(&self, delta: isize) {
        let gauge = &PortalMetrics::global().connections.running_threads;
        if delta >= 0 {
            self.running.fetch_add(delta as usize, Ordering::AcqRel);
            gauge.add(delta as i64);
        } else {
            self.running.fetch_sub(delta.unsigned_abs(), Ordering::AcqRel);
            gauge.sub(delta.unsigned_abs() as i64);
        }
    }

    fn maybe_compact(self: &Arc<Self>) {
        let due = {
            let mut table = self.table.lock();
            let now = Instant::now();
            if now >= table.next_check {
                table.next_check = now + self.config.compact_interval;
                true
            } else {
                false
            }
        };
        if due {
            self.compact();
        }
    }

    fn lookup_or_create(self: &Arc<Self>, header: &OpHeader<T::Context>) -> Result<Arc<HostPortal<T, O>>> {
        self.maybe_compact();

        let mut table = self.table.lock();
        if table.shut_down {
            return Err(Error::ShutDown);
        }
        if let Some(pool) = table.pools.get(&header.endpoint) {
            return Ok(pool.clone());
        }

        let key = header.endpoint.clone();
        let invalid_host = !self.transport.resolve(key.host(), key.port());
        if invalid_host {
            warn!(host = %key, "can't resolve host");
        }
        let pool = HostPortal::new(
            self.clone(),
            key.clone(),
            header.connect_context.clone(),
            self.config.min_host_connections,
            self.config.max_host_connections,
            invalid_host,
        );
        table.pools.insert(key.clone(), pool.clone());
        PortalMetrics::global().host_portals.inc();
        info!(host = %key, "new endpoint pool");
        Ok(pool)
    }

    fn submit(self: &Arc<Self>, mut q: QueuedOp<O>, placement: Placement) -> Result<()> {
        loop {
            let pool = match self.lookup_or_create(q.op.header()) {
                Ok(pool) => pool,
                Err(e) => {
                    q.complete(OpStatus::Generic);
                    return Err(e);
                }
            };
            match pool.submit(q, placement) {
                Ok(()) => return Ok(()),
                // Collected between lookup and enqueue
                Err(back) => q = back,
            }
        }
    }

    fn submit_dedicated(self: &Arc<Self>, mut q: QueuedOp<O>) -> Result<()> {
        loop {
            let parent = match self.lookup_or_create(q.op.header()) {
                Ok(pool) => pool,
                Err(e) => {
                    q.complete(OpStatus::Generic);
                    return Err(e);
                }
            };

            let mut pstate = parent.state.lock();
            if pstate.retired {
                continue;
            }

            let free = pstate.sync_list.iter().position(|sub| {
                sub.state
                    .try_lock()
                    .map_or(false, |s| sub.accepts_dedicated(&s))
            });
            let sub = match free {
                Some(i) => pstate.sync_list[i].clone(),
                None => {
                    let sub = HostPortal::new(
                        self.clone(),
                        parent.key.clone(),
                        parent.connect_context.clone(),
                        1,
                        1,
                        pstate.invalid_host,
                    );
                    pstate.sync_list.push(sub.clone());
                    debug!(host = %parent.key, count = pstate.sync_list.len(), "new dedicated pool");
                    sub
                }
            };
            {
                let mut s = sub.state.lock();
                sub.enqueue_locked(&mut s, q, Placement::Front);
            }
            drop(pstate);

            sub.rescale();
            return Ok(());
        }
    }

    /// Close one connection somewhere in the registry to make room
    pub(crate) fn evict_one(&self) {
        let victim = {
            let table = self.table.lock();
            let mut shared = Vec::new();
            let mut dedicated = Vec::new();
            for pool in table.pools.values() {
                let pstate = pool.state.lock();
                for conn in pstate.conns.values() {
                    if let Some((workload, _)) = conn.load() {
                        shared.push((conn.clone(), workload));
                    }
                }
                for sub in &pstate.sync_list {
                    let s = sub.state.lock();
                    if let Some(conn) = s.conns.values().next() {
                        if let Some((_, last_used)) = conn.load() {
                            dedicated.push((conn.clone(), last_used));
                        }
                    }
                }
            }
            scaling::choose_victim(shared, dedicated)
        };

        let conn: Arc<HostConnection<T, O>> = match victim {
            Some(Victim::Shared(c)) | Some(Victim::Dedicated(c)) => c,
            None => return,
        };
        warn!(conn = conn.id, "connection budget exhausted, evicting");
        PortalMetrics::global().connections.evictions.inc();
        conn.request_shutdown();
    }

    fn compact(&self) -> usize {
        let pools: Vec<_> = self.table.lock().pools.values().cloned().collect();
        let mut removed = 0;

        for pool in pools {
            pool.reap();
            pool.compact_dedicated();

            let retired = {
                let mut table = self.table.lock();
                let mut pstate = pool.state.lock();
                if !pstate.retired && pstate.is_idle() {
                    pstate.retired = true;
                    table.pools.remove(&pool.key);
                    true
                } else {
                    false
                }
            };
            if retired {
                removed += 1;
                PortalMetrics::global().host_portals.dec();
                info!(host = %pool.key, "removed idle endpoint pool");
            }
        }

        removed
    }

    fn shutdown(&self) {
        let pools: Vec<_> = {
            let mut table = self.table.lock();
            if table.shut_down {
                return;
            }
            table.shut_down = true;
            table.pools.drain().map(|(_, pool)| pool).collect()
        };

        info!(pools = pools.len(), "shutting down portal context");
        for pool in pools {
            pool.shutdown();
            PortalMetrics::global().host_portals.dec();
        }
    }
}

/// Registry of endpoint pools sharing one transport and policy.
///
/// Dropping the context shuts it down: queued operations fail with
/// [`OpStatus::Generic`] and every connection is closed and joined.
pub struct PortalContext<T, O>
where
    T: Transport,
    O: Operation<T::Stream, T::Context>,
{
    inner: Arc<Inner<T, O>>,
}

impl<T, O> PortalContext<T, O>
where
    T: Transport,
    O: Operation<T::Stream, T::Context>,
{
    /// Create a context, validating `config`
    pub fn new(transport: T, config: PortalConfig) -> Result<Self> {
        config.validate()?;
        let next_check = Instant::now() + config.compact_interval;
        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                config,
                table: Mutex::new(Table {
                    pools: HashMap::new(),
                    next_check,
                    shut_down: false,
                }),
                running: AtomicUsize::new(0),
            }),
        })
    }

    /// Pool policy in effect
    pub fn config(&self) -> &PortalConfig {
        &self.inner.config
    }

    /// The transport connections are opened with
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Build an operation header carrying this context's default retry budget
    pub fn new_header(
        &self,
        endpoint: &str,
        connect_context: T::Context,
        timeout: Duration,
        workload: i64,
    ) -> Result<OpHeader<T::Context>> {
        let key = EndpointKey::parse(endpoint)?;
        Ok(OpHeader::new(
            key,
            connect_context,
            timeout,
            workload,
            self.inner.config.max_retry,
        ))
    }

    /// Queue `op` on its endpoint's pool.
    ///
    /// The result is reported to `sink`. An error means the operation was
    /// rejected outright; it has still been delivered to `sink`.
    pub fn submit(&self, op: O, sink: Arc<dyn CompletionSink<O>>) -> Result<()> {
        self.submit_with(op, sink, Placement::Back)
    }

    /// [`submit`](Self::submit) with an explicit queue placement
    pub fn submit_with(&self, op: O, sink: Arc<dyn CompletionSink<O>>, placement: Placement) -> Result<()> {
        self.inner.submit(QueuedOp::new(op, sink), placement)
    }

    /// Run `op` on a connection of its own, never multiplexed with other work
    pub fn submit_dedicated(&self, op: O, sink: Arc<dyn CompletionSink<O>>) -> Result<()> {
        self.inner.submit_dedicated(QueuedOp::new(op, sink))
    }

    /// Reap closed connections and drop idle pools. Returns the number of
    /// endpoint pools removed.
    pub fn compact(&self) -> usize {
        self.inner.compact()
    }

    /// Fail queued work, close every connection and wait for them
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Connection pipelines currently running
    pub fn running_threads(&self) -> usize {
        self.inner.running_threads()
    }

    /// Endpoint pools currently registered
    pub fn host_count(&self) -> usize {
        self.inner.table.lock().pools.len()
    }

    /// Snapshot of the pool for `endpoint`, if one exists
    pub fn host_stats(&self, endpoint: &str) -> Option<HostStats> {
        let key = EndpointKey::parse(endpoint).ok()?;
        let pool = self.inner.table.lock().pools.get(&key).cloned()?;
        Some(pool.stats())
    }
}

impl<T, O> Drop for PortalContext<T, O>
where
    T: Transport,
    O: Operation<T::Stream, T::Context>,
{
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}
