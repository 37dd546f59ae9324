//! Bounded pool of persistent control-mode connections.
//!
//! Slots live in an arena addressed by index with a side map from connection
//! id to slot. A connection is either idle (channel parked in its slot) or
//! checked out (channel owned by a [`PooledConnection`]). The total of open
//! slots plus in-progress opens never exceeds `max_connections`.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::MuxError;
use crate::tmux::{ControlChannel, ControlConnector, ControlReply};

struct Slot {
    id: u64,
    channel: Option<Box<dyn ControlChannel>>,
    idle_since: Instant,
    checked_out: bool,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    by_id: HashMap<u64, usize>,
    idle: VecDeque<usize>,
    opening: usize,
    next_id: u64,
    closed: bool,
}

impl PoolState {
    fn open_count(&self) -> usize {
        self.by_id.len()
    }

    fn insert(&mut self, channel: Option<Box<dyn ControlChannel>>, checked_out: bool) -> (usize, u64) {
        self.next_id += 1;
        let id = self.next_id;
        let slot = Slot {
            id,
            channel,
            idle_since: Instant::now(),
            checked_out,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.by_id.insert(id, index);
        if !checked_out {
            self.idle.push_back(index);
        }
        (index, id)
    }

    fn remove(&mut self, index: usize) -> Option<Slot> {
        let slot = self.slots.get_mut(index)?.take()?;
        self.by_id.remove(&slot.id);
        self.idle.retain(|i| *i != index);
        self.free.push(index);
        Some(slot)
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    opened: AtomicU64,
    closed: AtomicU64,
    open_failures: AtomicU64,
    health_check_failures: AtomicU64,
    acquires: AtomicU64,
    acquire_waits: AtomicU64,
    acquire_timeouts: AtomicU64,
    acquire_micros: AtomicU64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct PoolMetrics {
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    pub opening: usize,
    pub opened: u64,
    pub closed: u64,
    pub open_failures: u64,
    pub health_check_failures: u64,
    pub acquire_waits: u64,
    pub acquire_timeouts: u64,
    pub avg_acquire_ms: f64,
}

struct PoolShared {
    connector: Arc<dyn ControlConnector>,
    config: PoolConfig,
    acquire_timeout: Duration,
    state: Mutex<PoolState>,
    available: Notify,
    cancel: CancellationToken,
    counters: PoolCounters,
}

enum Take {
    Idle(usize, u64, Box<dyn ControlChannel>),
    Open,
    Wait,
}

/// A checked-out connection. Hand it back with [`ConnectionPool::release`];
/// dropping it instead discards the underlying channel.
pub struct PooledConnection {
    shared: Arc<PoolShared>,
    slot: usize,
    id: u64,
    channel: Option<Box<dyn ControlChannel>>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn execute_many(
        &mut self,
        commands: &[Vec<String>],
        limit: Duration,
    ) -> Result<Vec<ControlReply>, MuxError> {
        match self.channel.as_mut() {
            Some(channel) => channel.execute_many(commands, limit).await,
            None => Err(MuxError::Connection("connection already released".into())),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.channel.take().is_none() {
            return;
        }
        let removed = self.shared.state.lock().remove(self.slot);
        if removed.is_some() {
            self.shared.counters.closed.fetch_add(1, Ordering::Relaxed);
            debug!(id = self.id, "pooled connection dropped without release");
        }
        self.shared.available.notify_one();
    }
}

/// Pool of control-mode connections to one multiplexer socket.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    maintenance: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionPool {
    /// `acquire_timeout` bounds how long [`acquire`](Self::acquire) waits.
    pub fn new(
        connector: Arc<dyn ControlConnector>,
        config: PoolConfig,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                connector,
                config,
                acquire_timeout,
                state: Mutex::new(PoolState::default()),
                available: Notify::new(),
                cancel: CancellationToken::new(),
                counters: PoolCounters::default(),
            }),
            maintenance: Arc::new(Mutex::new(None)),
        }
    }

    /// Eagerly open `min_connections` and start the health-check loop.
    pub async fn initialize(&self) -> Result<(), MuxError> {
        self.shared.replenish().await?;
        let weak = Arc::downgrade(&self.shared);
        let cancel = self.shared.cancel.clone();
        let interval = self.shared.config.health_interval();
        let handle = tokio::spawn(maintenance_loop(weak, cancel, interval));
        if let Some(previous) = self.maintenance.lock().replace(handle) {
            previous.abort();
        }
        info!(
            min = self.shared.config.min_connections,
            max = self.shared.config.max_connections,
            "connection pool initialized"
        );
        Ok(())
    }

    /// An idle connection, a newly opened one, or the next one released.
    pub async fn acquire(&self) -> Result<PooledConnection, MuxError> {
        let shared = &self.shared;
        let started = Instant::now();
        let deadline = started + shared.acquire_timeout;
        let mut waited = false;
        loop {
            let notified = shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let take = shared.try_take()?;
            let conn = match take {
                Take::Idle(slot, id, channel) => Some(PooledConnection {
                    shared: shared.clone(),
                    slot,
                    id,
                    channel: Some(channel),
                }),
                Take::Open => Some(shared.open_checked_out().await?),
                Take::Wait => None,
            };
            if let Some(conn) = conn {
                shared.counters.acquires.fetch_add(1, Ordering::Relaxed);
                shared
                    .counters
                    .acquire_micros
                    .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                return Ok(conn);
            }

            if !waited {
                waited = true;
                shared.counters.acquire_waits.fetch_add(1, Ordering::Relaxed);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                shared
                    .counters
                    .acquire_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    max = shared.config.max_connections,
                    waited_ms = shared.acquire_timeout.as_millis() as u64,
                    "connection pool exhausted"
                );
                return Err(MuxError::Connection(format!(
                    "pool exhausted: {} connections busy",
                    shared.config.max_connections
                )));
            }
        }
    }

    /// Return a connection. Unhealthy connections, and any connection
    /// released after shutdown, are closed instead of parked.
    pub async fn release(&self, mut conn: PooledConnection, healthy: bool) {
        let Some(channel) = conn.channel.take() else {
            return;
        };
        let shared = &self.shared;
        let discard = {
            let mut state = shared.state.lock();
            if healthy && !state.closed {
                let slot = state
                    .slots
                    .get_mut(conn.slot)
                    .and_then(Option::as_mut)
                    .filter(|slot| slot.id == conn.id);
                if let Some(slot) = slot {
                    slot.channel = Some(channel);
                    slot.checked_out = false;
                    slot.idle_since = Instant::now();
                    state.idle.push_back(conn.slot);
                    None
                } else {
                    Some(channel)
                }
            } else {
                state.remove(conn.slot);
                Some(channel)
            }
        };
        if let Some(mut channel) = discard {
            channel.close().await;
            shared.counters.closed.fetch_add(1, Ordering::Relaxed);
            debug!(id = conn.id, healthy, "closed released connection");
        }
        shared.available.notify_one();
    }

    /// One maintenance pass: probe idle connections, close unhealthy and
    /// surplus idle ones, then reopen up to the minimum.
    pub async fn run_maintenance(&self) {
        self.shared.maintain().await;
    }

    pub fn metrics(&self) -> PoolMetrics {
        let counters = &self.shared.counters;
        let state = self.shared.state.lock();
        let open = state.open_count();
        let idle = state.idle.len();
        let acquires = counters.acquires.load(Ordering::Relaxed);
        let micros = counters.acquire_micros.load(Ordering::Relaxed);
        PoolMetrics {
            open,
            idle,
            in_use: open - idle,
            opening: state.opening,
            opened: counters.opened.load(Ordering::Relaxed),
            closed: counters.closed.load(Ordering::Relaxed),
            open_failures: counters.open_failures.load(Ordering::Relaxed),
            health_check_failures: counters.health_check_failures.load(Ordering::Relaxed),
            acquire_waits: counters.acquire_waits.load(Ordering::Relaxed),
            acquire_timeouts: counters.acquire_timeouts.load(Ordering::Relaxed),
            avg_acquire_ms: if acquires == 0 {
                0.0
            } else {
                micros as f64 / acquires as f64 / 1000.0
            },
        }
    }

    /// Close idle connections and refuse further acquires. Checked-out
    /// connections are closed when released.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!(error = %e, "pool maintenance task ended abnormally");
            }
        }
        let idle: Vec<Box<dyn ControlChannel>> = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let indexes: Vec<usize> = state.idle.drain(..).collect();
            indexes
                .into_iter()
                .filter_map(|i| state.remove(i))
                .filter_map(|slot| slot.channel)
                .collect()
        };
        self.shared.available.notify_waiters();
        let count = idle.len();
        for mut channel in idle {
            channel.close().await;
            self.shared.counters.closed.fetch_add(1, Ordering::Relaxed);
        }
        info!(closed = count, "connection pool shut down");
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.slot)
            .field("id", &self.id)
            .finish()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl PoolShared {
    fn try_take(&self) -> Result<Take, MuxError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MuxError::Shutdown);
        }
        while let Some(index) = state.idle.pop_front() {
            let Some(slot) = state.slots.get_mut(index).and_then(Option::as_mut) else {
                continue;
            };
            if let Some(channel) = slot.channel.take() {
                slot.checked_out = true;
                return Ok(Take::Idle(index, slot.id, channel));
            }
        }
        if state.open_count() + state.opening < self.config.max_connections {
            state.opening += 1;
            return Ok(Take::Open);
        }
        Ok(Take::Wait)
    }

    /// Open a connection for which an `opening` reservation is held.
    async fn connect_reserved(&self) -> Result<Box<dyn ControlChannel>, MuxError> {
        let result = self.connector.connect().await;
        if result.is_err() {
            self.state.lock().opening -= 1;
            self.counters.open_failures.fetch_add(1, Ordering::Relaxed);
            self.available.notify_one();
        }
        result
    }

    async fn open_checked_out(self: &Arc<Self>) -> Result<PooledConnection, MuxError> {
        let channel = self.connect_reserved().await?;
        let (slot, id) = {
            let mut state = self.state.lock();
            state.opening -= 1;
            state.insert(None, true)
        };
        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        debug!(id, "opened control connection");
        Ok(PooledConnection {
            shared: self.clone(),
            slot,
            id,
            channel: Some(channel),
        })
    }

    /// Open idle connections until `min_connections` is reached.
    async fn replenish(&self) -> Result<(), MuxError> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed
                    || state.open_count() + state.opening >= self.config.min_connections
                {
                    return Ok(());
                }
                state.opening += 1;
            }
            let channel = self.connect_reserved().await?;
            let id = {
                let mut state = self.state.lock();
                state.opening -= 1;
                state.insert(Some(channel), false).1
            };
            self.counters.opened.fetch_add(1, Ordering::Relaxed);
            self.available.notify_one();
            debug!(id, "opened idle control connection");
        }
    }

    async fn maintain(&self) {
        let probe_limit = self.acquire_timeout;
        let max_idle = self.config.max_idle();

        // Idle channels leave their slots while probed so acquire cannot hand
        // them out mid-probe.
        let probing: Vec<(usize, u64, Box<dyn ControlChannel>)> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let indexes: Vec<usize> = state.idle.drain(..).collect();
            let mut taken = Vec::new();
            for index in indexes {
                if let Some(slot) = state.slots.get_mut(index).and_then(Option::as_mut) {
                    if let Some(channel) = slot.channel.take() {
                        slot.checked_out = true;
                        taken.push((index, slot.id, channel));
                    }
                }
            }
            taken
        };

        let mut healthy = Vec::new();
        let mut to_close = Vec::new();
        let mut failed = Vec::new();
        for (index, id, mut channel) in probing {
            if channel.probe(probe_limit).await {
                healthy.push((index, id, channel));
            } else {
                self.counters
                    .health_check_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(id, "control connection failed health check");
                failed.push(index);
                to_close.push(channel);
            }
        }

        {
            let mut state = self.state.lock();
            for index in failed {
                state.remove(index);
            }
            let mut returned: Vec<(usize, Instant)> = Vec::new();
            for (index, id, channel) in healthy {
                let closed = state.closed;
                let slot = state
                    .slots
                    .get_mut(index)
                    .and_then(Option::as_mut)
                    .filter(|slot| slot.id == id && !closed);
                if let Some(slot) = slot {
                    slot.channel = Some(channel);
                    slot.checked_out = false;
                    returned.push((index, slot.idle_since));
                } else {
                    state.remove(index);
                    to_close.push(channel);
                }
            }
            returned.sort_by_key(|(_, since)| *since);

            // Close the longest-idle connections above the minimum.
            let now = Instant::now();
            for (index, since) in returned {
                let surplus = state.open_count() > self.config.min_connections;
                if surplus && now.duration_since(since) >= max_idle {
                    if let Some(channel) = state.remove(index).and_then(|slot| slot.channel) {
                        to_close.push(channel);
                    }
                } else {
                    state.idle.push_back(index);
                }
            }
        }

        let closed = to_close.len();
        for mut channel in to_close {
            channel.close().await;
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
        }
        if closed > 0 {
            debug!(closed, "pool maintenance closed connections");
            self.available.notify_one();
        }
        if let Err(e) = self.replenish().await {
            warn!(error = %e, "failed to replenish connection pool");
        }
    }
}

async fn maintenance_loop(shared: Weak<PoolShared>, cancel: CancellationToken, interval: Duration) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.maintain().await;
    }
}
