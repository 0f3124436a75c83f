//! Scaling and eviction policy
//!
//! Pure decision functions; the pool feeds them a snapshot taken under its
//! lock and applies the result.

use std::time::{Duration, Instant};

/// Pool snapshot consumed by [`plan`]
#[derive(Clone, Copy, Debug)]
pub struct ScaleInput {
    /// Operations waiting in the pending queue
    pub queued: usize,
    /// Sum of workload over the pending queue
    pub workload: i64,
    /// Live plus reserved connections
    pub n_conn: usize,
    /// Per-endpoint minimum
    pub min_conn: usize,
    /// Per-endpoint maximum
    pub max_conn: usize,
    /// Workload one connection absorbs before another is warranted
    pub max_workload: i64,
    /// Endpoint host failed to resolve
    pub invalid_host: bool,
}

/// Stability state carried by a pool between planning rounds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ratchet {
    /// Connection count believed sustainable
    pub stable_conn: usize,
    /// No growth past `stable_conn` before this instant
    pub pause_until: Option<Instant>,
}

impl Ratchet {
    /// Fresh ratchet; a new pool trusts its maximum until shown otherwise
    pub fn new(max_conn: usize) -> Self {
        Self {
            stable_conn: max_conn,
            pause_until: None,
        }
    }

    /// Pull the stable target down to `n_conn` after a failure and back off
    pub fn destabilize(&mut self, n_conn: usize, wait_stable: Duration, now: Instant) {
        self.stable_conn = n_conn.max(1);
        self.pause_until = Some(now + wait_stable);
    }

    fn paused(&self, now: Instant) -> bool {
        self.pause_until.map_or(false, |t| now <= t)
    }
}

/// Number of connections to open now.
///
/// Cold pools jump to their minimum; beyond that demand is pending workload
/// over `max_workload`, capped at the maximum. Growth past the stable
/// target is one connection per `wait_stable` window.
pub fn plan(input: &ScaleInput, ratchet: &mut Ratchet, wait_stable: Duration, now: Instant) -> usize {
    let mut n_new = if input.queued == 0 {
        0
    } else if input.n_conn < input.min_conn {
        input.min_conn - input.n_conn
    } else {
        let demand = usize::try_from(input.workload / input.max_workload.max(1)).unwrap_or(0);
        demand.min(input.max_conn.saturating_sub(input.n_conn))
    };

    if n_new > 0 && input.n_conn + n_new > ratchet.stable_conn {
        if !ratchet.paused(now) {
            ratchet.stable_conn = (ratchet.stable_conn + 1).min(input.max_conn).max(1);
            ratchet.pause_until = Some(now + wait_stable);
            n_new = 1;
        } else {
            n_new = ratchet.stable_conn.saturating_sub(input.n_conn);
        }
    }

    if input.invalid_host && input.n_conn == 0 && input.queued > 0 {
        // One connection to drain the queue with resolution failures.
        n_new = 1;
    }

    n_new
}

/// Connection chosen by [`choose_victim`]
#[derive(Debug, PartialEq, Eq)]
pub enum Victim<T> {
    /// A shared, multiplexed connection
    Shared(T),
    /// The sole connection of a dedicated sub-pool
    Dedicated(T),
}

/// Pick the connection to close when the global budget is exhausted.
///
/// The least loaded shared connection is the primary candidate; an idle
/// dedicated connection (oldest `last_used` first) wins unless the primary
/// carries no workload at all. Ties go to the first candidate seen.
pub fn choose_victim<T>(
    shared: impl IntoIterator<Item = (T, i64)>,
    dedicated: impl IntoIterator<Item = (T, Instant)>,
) -> Option<Victim<T>> {
    let best_shared = shared.into_iter().min_by_key(|(_, workload)| *workload);
    let best_dedicated = dedicated.into_iter().min_by_key(|(_, last_used)| *last_used);

    match (best_shared, best_dedicated) {
        (Some((_, workload)), Some((d, _))) if workload > 0 => Some(Victim::Dedicated(d)),
        (None, Some((d, _))) => Some(Victim::Dedicated(d)),
        (Some((s, _)), _) => Some(Victim::Shared(s)),
        (None, None) => None,
    }
}
