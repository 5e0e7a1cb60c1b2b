//! An optional pool of [`Connection`]s sharing one server configuration.
//!
//! Grounded on the teacher's `cmap`/`cmap::worker` (a handle-to-background-
//! state pool type, cheap to clone, that checks connections out, tracks
//! per-connection load, and quarantines + reconnects failed ones) scaled
//! down from CMAP's full generation/SDAM-driven state machine to spec.md
//! §4.9's simpler policy: `N` connections, round-robin or least-busy
//! dispatch, exponential-backoff reconnect with full jitter.

use std::{
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use derive_where::derive_where;
use rand::Rng;
use serde_json::Value;
use tokio::sync::RwLock;
use typed_builder::TypedBuilder;

use crate::{
    conn::{Connection, ConnectionOptions, RunOutcome},
    error::{Error, Result},
    term::Term,
};

/// Default base delay before the first reconnect attempt after a slot is
/// quarantined.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(250);
/// Default ceiling on the reconnect backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Configuration for a [`ConnectionPool`].
///
/// spec.md §4.9 / §6: `size`, `initialDelayMs`, `maxDelayMs`.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ConnectionPoolOptions {
    /// Number of connections the pool maintains.
    #[builder(default = 4)]
    pub size: usize,

    /// Base delay for the exponential reconnect backoff.
    #[builder(default = DEFAULT_INITIAL_DELAY)]
    pub initial_delay: Duration,

    /// Ceiling the reconnect backoff delay never exceeds.
    #[builder(default = DEFAULT_MAX_DELAY)]
    pub max_delay: Duration,

    /// Dispatch policy used to pick a connection for each `run`.
    #[builder(default = DispatchPolicy::LeastBusy)]
    pub policy: DispatchPolicy,
}

impl Default for ConnectionPoolOptions {
    fn default() -> Self {
        ConnectionPoolOptions::builder().build()
    }
}

/// How [`ConnectionPool::run`] picks a connection for a query.
///
/// spec.md §4.9: "default: least outstanding tokens; ties broken round
/// robin".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// Pick the connection with the fewest outstanding tokens, breaking
    /// ties by round robin.
    LeastBusy,
    /// Cycle through connections regardless of load.
    RoundRobin,
}

struct Slot {
    conn: RwLock<Option<Connection>>,
    outstanding: AtomicUsize,
    consecutive_failures: AtomicU32,
    quarantined_until: RwLock<Option<Instant>>,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            conn: RwLock::new(None),
            outstanding: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            quarantined_until: RwLock::new(None),
        }
    }
}

struct Inner {
    slots: Vec<Slot>,
    conn_options: ConnectionOptions,
    pool_options: ConnectionPoolOptions,
    round_robin: AtomicUsize,
}

/// `N` connections to the same server, dispatched by [`DispatchPolicy`] and
/// reconnected with exponential backoff on failure.
///
/// Cheap to clone: clones share the same slots. A [`Cursor`](crate::Cursor)
/// returned from [`ConnectionPool::run`] is bound to the connection that
/// produced it and does not migrate between slots.
#[derive_where(Clone)]
pub struct ConnectionPool(Arc<Inner>);

impl ConnectionPool {
    /// Establishes `pool_options.size` connections against `conn_options`.
    /// A connection that fails to establish is left quarantined and
    /// reconnected in the background rather than failing the whole pool.
    pub async fn connect(
        conn_options: ConnectionOptions,
        pool_options: ConnectionPoolOptions,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(pool_options.size);
        for _ in 0..pool_options.size {
            slots.push(Slot::empty());
        }
        let inner = Arc::new(Inner {
            slots,
            conn_options,
            pool_options,
            round_robin: AtomicUsize::new(0),
        });
        let pool = ConnectionPool(inner);

        for idx in 0..pool.0.slots.len() {
            match Connection::connect(pool.0.conn_options.clone()).await {
                Ok(conn) => *pool.0.slots[idx].conn.write().await = Some(conn),
                Err(err) => {
                    tracing::debug!(slot = idx, error = %err, "initial connect failed, quarantining");
                    pool.quarantine(idx).await;
                }
            }
        }

        Ok(pool)
    }

    /// Runs `term` on a connection chosen by this pool's [`DispatchPolicy`].
    pub async fn run(
        &self,
        term: &dyn Term,
        global_opts: std::collections::BTreeMap<String, Value>,
    ) -> Result<RunOutcome> {
        let idx = self
            .pick_slot()
            .await
            .ok_or_else(|| Error::connection_closed(None))?;

        let conn = {
            let guard = self.0.slots[idx].conn.read().await;
            guard.clone().ok_or_else(|| Error::connection_closed(None))?
        };

        self.0.slots[idx].outstanding.fetch_add(1, Ordering::AcqRel);
        let result = conn.run(term, global_opts).await;
        self.0.slots[idx].outstanding.fetch_sub(1, Ordering::AcqRel);

        if let Err(err) = &result {
            if err.is_connection_closed() {
                self.quarantine(idx).await;
                self.spawn_reconnect(idx);
            }
        }
        result
    }

    /// Requests server info from any one available connection.
    pub async fn server(&self) -> Result<Value> {
        let idx = self
            .pick_slot()
            .await
            .ok_or_else(|| Error::connection_closed(None))?;
        let conn = {
            let guard = self.0.slots[idx].conn.read().await;
            guard.clone().ok_or_else(|| Error::connection_closed(None))?
        };
        conn.server().await
    }

    /// Closes every connection in the pool.
    pub async fn close(&self) -> Result<()> {
        for slot in &self.0.slots {
            if let Some(conn) = slot.conn.write().await.take() {
                conn.close(false).await?;
            }
        }
        Ok(())
    }

    async fn pick_slot(&self) -> Option<usize> {
        self.release_expired_quarantines().await;

        let mut candidates = Vec::new();
        for (idx, slot) in self.0.slots.iter().enumerate() {
            if slot.quarantined_until.read().await.is_none() && slot.conn.read().await.is_some() {
                candidates.push(idx);
            }
        }
        if candidates.is_empty() {
            return None;
        }

        let weighted: Vec<(usize, usize)> = candidates
            .iter()
            .map(|&idx| (idx, self.0.slots[idx].outstanding.load(Ordering::Acquire)))
            .collect();
        let start = self.0.round_robin.fetch_add(1, Ordering::Relaxed);
        Some(choose(self.0.pool_options.policy, &weighted, start))
    }

    async fn release_expired_quarantines(&self) {
        let now = Instant::now();
        for slot in &self.0.slots {
            let expired = matches!(*slot.quarantined_until.read().await, Some(until) if now >= until);
            if expired {
                *slot.quarantined_until.write().await = None;
            }
        }
    }

    async fn quarantine(&self, idx: usize) {
        let slot = &self.0.slots[idx];
        *slot.conn.write().await = None;
        let failures = slot.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let delay = backoff_delay(
            failures,
            self.0.pool_options.initial_delay,
            self.0.pool_options.max_delay,
        );
        *slot.quarantined_until.write().await = Some(Instant::now() + delay);
        tracing::debug!(slot = idx, failures, delay_ms = delay.as_millis(), "slot quarantined");
    }

    fn spawn_reconnect(&self, idx: usize) {
        let pool = self.clone();
        tokio::spawn(async move {
            let delay = {
                let slot = &pool.0.slots[idx];
                let until = *slot.quarantined_until.read().await;
                match until {
                    Some(until) => until.saturating_duration_since(Instant::now()),
                    None => Duration::ZERO,
                }
            };
            tokio::time::sleep(delay).await;

            match Connection::connect(pool.0.conn_options.clone()).await {
                Ok(conn) => {
                    let slot = &pool.0.slots[idx];
                    *slot.conn.write().await = Some(conn);
                    *slot.quarantined_until.write().await = None;
                    slot.consecutive_failures.store(0, Ordering::Release);
                    tracing::debug!(slot = idx, "reconnected");
                }
                Err(err) => {
                    tracing::debug!(slot = idx, error = %err, "reconnect attempt failed");
                    pool.quarantine(idx).await;
                    pool.spawn_reconnect(idx);
                }
            }
        });
    }
}

/// Picks one slot index out of `candidates` (slot index, current outstanding
/// load), given the dispatch policy and a monotonically-advancing `start`
/// offset used both for round robin and for rotating least-busy's
/// tie-break search order. Pulled out of `pick_slot` as a pure function so
/// the selection math is testable without standing up real connections.
fn choose(policy: DispatchPolicy, candidates: &[(usize, usize)], start: usize) -> usize {
    match policy {
        DispatchPolicy::RoundRobin => candidates[start % candidates.len()].0,
        DispatchPolicy::LeastBusy => {
            let n = candidates.len();
            let mut best = candidates[start % n];
            for offset in 1..n {
                let candidate = candidates[(start + offset) % n];
                if candidate.1 < best.1 {
                    best = candidate;
                }
            }
            best.0
        }
    }
}

/// Exponential backoff with full jitter: `delay = random(0, min(max, base *
/// 2^(failures - 1)))`.
fn backoff_delay(failures: u32, base: Duration, max: Duration) -> Duration {
    let exp = failures.saturating_sub(1).min(20);
    let capped = base
        .checked_mul(1u32 << exp)
        .unwrap_or(max)
        .min(max);
    let jittered_ms = rand::rng().random_range(0..=capped.as_millis().max(1) as u64);
    Duration::from_millis(jittered_ms)
}
