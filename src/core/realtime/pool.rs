//! Keyed connection pool for realtime sockets.
//!
//! Connections are grouped by [`PoolKey`] (base URL, backend, output format,
//! voice). Each key holds at most `max_per_key` connections, in-flight dials
//! included. An acquirer gets, in order of preference:
//!
//! 1. an idle, unexpired entry for the key,
//! 2. a freshly dialed connection if the key has spare capacity,
//! 3. a place in the key's FIFO waiter queue.
//!
//! A released entry is handed straight to the oldest waiter. A force-closed
//! entry is destroyed and the oldest waiter is told to retry, which usually
//! makes it dial a replacement.
//!
//! # Expiry
//!
//! An entry is expired when any of these holds:
//!
//! - its age exceeds `max_life` (busy or not),
//! - it is idle and unused for longer than `idle_ttl`,
//! - it is idle and no text was written for longer than `text_idle_ttl`
//!   (measured from last use if no text was ever written).
//!
//! Expiry is checked on acquisition, on release, and by a background reaper
//! every `reap_interval`.
//!
//! # Locking
//!
//! Each key pool has its own lock. The key map and the connection index have
//! separate registry locks that are only held for lookups and inserts and are
//! never taken while a key-pool lock is held. Transports are closed after all
//! locks are released.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{Transport, TransportError};

/// Identifier of one pooled connection, unique within a pool.
pub type ConnectionId = u64;

// =============================================================================
// Configuration
// =============================================================================

pub const DEFAULT_MAX_PER_KEY: usize = 4;
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_LIFE: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_TEXT_IDLE_TTL: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Pool limits and expiry thresholds. Zero values fall back to the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_per_key: usize,
    pub idle_ttl: Duration,
    pub max_life: Duration,
    pub text_idle_ttl: Duration,
    pub reap_interval: Duration,
    /// Upper bound on a whole acquisition, waiting and dialing included.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_key: DEFAULT_MAX_PER_KEY,
            idle_ttl: DEFAULT_IDLE_TTL,
            max_life: DEFAULT_MAX_LIFE,
            text_idle_ttl: DEFAULT_TEXT_IDLE_TTL,
            reap_interval: DEFAULT_REAP_INTERVAL,
            acquire_timeout: None,
        }
    }
}

impl PoolConfig {
    fn normalized(self) -> Self {
        fn or(value: Duration, default: Duration) -> Duration {
            if value.is_zero() { default } else { value }
        }
        Self {
            max_per_key: if self.max_per_key == 0 {
                DEFAULT_MAX_PER_KEY
            } else {
                self.max_per_key
            },
            idle_ttl: or(self.idle_ttl, DEFAULT_IDLE_TTL),
            max_life: or(self.max_life, DEFAULT_MAX_LIFE),
            text_idle_ttl: or(self.text_idle_ttl, DEFAULT_TEXT_IDLE_TTL),
            reap_interval: or(self.reap_interval, DEFAULT_REAP_INTERVAL),
            acquire_timeout: self.acquire_timeout.filter(|d| !d.is_zero()),
        }
    }
}

// =============================================================================
// Keys, errors, stats
// =============================================================================

/// Routing key of a group of interchangeable connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    base_url: String,
    backend: String,
    format: String,
    reference_id: String,
}

impl PoolKey {
    /// Builds a key. Backend and format are case-normalized.
    pub fn new(
        base_url: impl Into<String>,
        backend: &str,
        format: Option<&str>,
        reference_id: Option<&str>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            backend: backend.to_ascii_lowercase(),
            format: format.map(str::to_ascii_lowercase).unwrap_or_default(),
            reference_id: reference_id.unwrap_or_default().to_string(),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.base_url, self.backend, self.format, self.reference_id
        )
    }
}

/// Acquisition failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Acquisition cancelled")]
    Cancelled,

    #[error("Acquisition timed out after {0:?}")]
    Timeout(Duration),

    #[error("Dial failed: {0}")]
    Dial(#[from] TransportError),

    #[error("Connection pool is shut down")]
    ShutDown,
}

/// Point-in-time counters for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyPoolStats {
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
    pub dialing: usize,
    pub waiters: usize,
}

// =============================================================================
// Internal state
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum ExpiryReason {
    MaxLife,
    Idle,
    TextIdle,
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MaxLife => "max_life",
            Self::Idle => "idle",
            Self::TextIdle => "text_idle",
        })
    }
}

/// Text-activity stamp, shared between an entry and the connection index.
#[derive(Debug, Default)]
struct EntryActivity {
    last_text: Mutex<Option<Instant>>,
}

impl EntryActivity {
    fn touch(&self) {
        *self.last_text.lock() = Some(Instant::now());
    }
}

struct PoolEntry<C> {
    id: ConnectionId,
    conn: Arc<C>,
    busy: bool,
    created: Instant,
    last_used: Instant,
    activity: Arc<EntryActivity>,
}

impl<C> PoolEntry<C> {
    fn expiry(&self, now: Instant, config: &PoolConfig) -> Option<ExpiryReason> {
        if now.saturating_duration_since(self.created) > config.max_life {
            return Some(ExpiryReason::MaxLife);
        }
        if self.busy {
            return None;
        }
        if now.saturating_duration_since(self.last_used) > config.idle_ttl {
            return Some(ExpiryReason::Idle);
        }
        let last_text = *self.activity.last_text.lock();
        let since_text = last_text.unwrap_or(self.last_used);
        if now.saturating_duration_since(since_text) > config.text_idle_ttl {
            return Some(ExpiryReason::TextIdle);
        }
        None
    }
}

/// What a waiter is woken with.
enum Handoff<C> {
    /// A released entry, still marked busy on the waiter's behalf.
    Entry(ConnectionId, Arc<C>, Arc<EntryActivity>),
    /// Capacity was freed; try again.
    Retry,
}

struct KeyPoolState<C> {
    entries: Vec<PoolEntry<C>>,
    dialing: usize,
    waiters: VecDeque<oneshot::Sender<Handoff<C>>>,
}

impl<C> KeyPoolState<C> {
    fn wake_one(&mut self) {
        wake_one(&mut self.waiters);
    }
}

/// Wakes the oldest live waiter with a retry signal.
fn wake_one<C>(waiters: &mut VecDeque<oneshot::Sender<Handoff<C>>>) {
    while let Some(tx) = waiters.pop_front() {
        if tx.send(Handoff::Retry).is_ok() {
            return;
        }
    }
}

struct KeyPool<C> {
    state: Mutex<KeyPoolState<C>>,
}

impl<C> KeyPool<C> {
    fn new() -> Self {
        Self {
            state: Mutex::new(KeyPoolState {
                entries: Vec::new(),
                dialing: 0,
                waiters: VecDeque::new(),
            }),
        }
    }
}

struct PoolInner<C> {
    config: PoolConfig,
    keys: Mutex<HashMap<PoolKey, Arc<KeyPool<C>>>>,
    index: Mutex<HashMap<ConnectionId, Arc<EntryActivity>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

enum Step<C: Transport> {
    Ready(PoolLease<C>),
    Dial,
    Wait(oneshot::Receiver<Handoff<C>>),
}

impl<C: Transport> PoolInner<C> {
    fn key_pool(&self, key: &PoolKey) -> Arc<KeyPool<C>> {
        self.keys
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyPool::new()))
            .clone()
    }

    fn all_key_pools(&self) -> Vec<(PoolKey, Arc<KeyPool<C>>)> {
        self.keys
            .lock()
            .iter()
            .map(|(k, kp)| (k.clone(), kp.clone()))
            .collect()
    }

    fn unindex(&self, ids: impl IntoIterator<Item = ConnectionId>) {
        let mut index = self.index.lock();
        for id in ids {
            index.remove(&id);
        }
    }

    fn touch_text(&self, id: ConnectionId) {
        let activity = self.index.lock().get(&id).cloned();
        if let Some(activity) = activity {
            activity.touch();
        }
    }

    /// One non-blocking acquisition attempt. Returns expired entries evicted
    /// along the way so the caller can close them outside the lock.
    fn try_acquire(
        self: &Arc<Self>,
        key: &PoolKey,
        kp: &Arc<KeyPool<C>>,
    ) -> (Step<C>, Vec<PoolEntry<C>>) {
        let now = Instant::now();
        let mut evicted = Vec::new();
        let mut state = kp.state.lock();

        let mut chosen = None;
        let mut i = 0;
        while i < state.entries.len() {
            if let Some(reason) = state.entries[i].expiry(now, &self.config) {
                let entry = state.entries.swap_remove(i);
                debug!(key = %key, conn_id = entry.id, %reason, "Evicting expired connection on acquire");
                evicted.push(entry);
                continue;
            }
            let entry = &mut state.entries[i];
            if !entry.busy {
                entry.busy = true;
                entry.last_used = now;
                chosen = Some((entry.id, entry.conn.clone(), entry.activity.clone()));
                break;
            }
            i += 1;
        }

        let step = if let Some((id, conn, activity)) = chosen {
            debug!(key = %key, conn_id = id, "Reusing idle connection");
            Step::Ready(PoolLease::new(self.clone(), kp.clone(), key.clone(), id, conn, activity))
        } else if state.entries.len() + state.dialing < self.config.max_per_key {
            state.dialing += 1;
            Step::Dial
        } else {
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            debug!(key = %key, waiters = state.waiters.len(), "Key at capacity, queueing acquirer");
            Step::Wait(rx)
        };

        // Slots freed by eviction that this acquirer did not take.
        let spare = self
            .config
            .max_per_key
            .saturating_sub(state.entries.len() + state.dialing);
        for _ in 0..evicted.len().min(spare) {
            state.wake_one();
        }
        (step, evicted)
    }

    /// Marks an entry idle, or hands it to the oldest waiter. Returns the
    /// connection if it expired and must be closed instead.
    fn release_entry(&self, kp: &KeyPool<C>, id: ConnectionId) -> Option<Arc<C>> {
        let now = Instant::now();
        let removed = {
            let mut state = kp.state.lock();
            let KeyPoolState {
                entries, waiters, ..
            } = &mut *state;
            let pos = entries.iter().position(|e| e.id == id)?;

            let entry = &mut entries[pos];
            entry.busy = false;
            entry.last_used = now;

            let expired = if self.shutdown.is_cancelled() {
                true
            } else if let Some(reason) = entry.expiry(now, &self.config) {
                debug!(conn_id = id, %reason, "Released connection already expired");
                true
            } else {
                false
            };

            if expired {
                let entry = entries.swap_remove(pos);
                wake_one(waiters);
                Some(entry.conn)
            } else {
                while let Some(tx) = waiters.pop_front() {
                    let handoff = Handoff::Entry(id, entry.conn.clone(), entry.activity.clone());
                    entry.busy = true;
                    if tx.send(handoff).is_ok() {
                        debug!(conn_id = id, "Handed released connection to waiter");
                        break;
                    }
                    entry.busy = false;
                }
                None
            }
        };
        if removed.is_some() {
            self.unindex([id]);
        }
        removed
    }

    /// Removes an entry and wakes one waiter to retry.
    fn remove_entry(&self, kp: &KeyPool<C>, id: ConnectionId) {
        {
            let mut state = kp.state.lock();
            if let Some(pos) = state.entries.iter().position(|e| e.id == id) {
                state.entries.swap_remove(pos);
            }
            state.wake_one();
        }
        self.unindex([id]);
    }

    /// Evicts expired entries across all keys.
    fn reap(&self, now: Instant) -> Vec<Arc<C>> {
        let mut closed = Vec::new();
        let mut ids = Vec::new();
        for (key, kp) in self.all_key_pools() {
            let mut state = kp.state.lock();
            let mut i = 0;
            while i < state.entries.len() {
                if let Some(reason) = state.entries[i].expiry(now, &self.config) {
                    let entry = state.entries.swap_remove(i);
                    if entry.busy {
                        warn!(key = %key, conn_id = entry.id, %reason, "Reaping busy connection past its maximum life");
                    } else {
                        debug!(key = %key, conn_id = entry.id, %reason, "Reaping expired connection");
                    }
                    ids.push(entry.id);
                    closed.push(entry.conn);
                    state.wake_one();
                    continue;
                }
                i += 1;
            }
        }
        self.unindex(ids);
        closed
    }
}

/// Closes a transport from a synchronous context.
fn close_detached<C: Transport>(conn: Arc<C>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { conn.close().await });
    }
}

async fn close_all<C: Transport>(conns: impl IntoIterator<Item = Arc<C>>) {
    for conn in conns {
        conn.close().await;
    }
}

// =============================================================================
// Acquisition guards
// =============================================================================

/// Keeps a dial slot reserved until the dial completes or is abandoned.
struct DialReservation<C: Transport> {
    inner: Arc<PoolInner<C>>,
    kp: Arc<KeyPool<C>>,
    armed: bool,
}

impl<C: Transport> DialReservation<C> {
    fn commit(mut self, key: &PoolKey, conn: C) -> PoolLease<C> {
        self.armed = false;
        let now = Instant::now();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Arc::new(conn);
        let activity = Arc::new(EntryActivity::default());
        {
            let mut state = self.kp.state.lock();
            state.dialing -= 1;
            state.entries.push(PoolEntry {
                id,
                conn: conn.clone(),
                busy: true,
                created: now,
                last_used: now,
                activity: activity.clone(),
            });
        }
        self.inner.index.lock().insert(id, activity.clone());
        info!(key = %key, conn_id = id, "Dialed new pooled connection");
        PoolLease::new(
            self.inner.clone(),
            self.kp.clone(),
            key.clone(),
            id,
            conn,
            activity,
        )
    }
}

impl<C: Transport> Drop for DialReservation<C> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.kp.state.lock();
            state.dialing -= 1;
            state.wake_one();
        }
    }
}

/// Queue slot of a blocked acquirer. If the acquirer goes away after being
/// handed an entry, the entry goes back to the pool; a retry signal is passed
/// on to the next waiter.
struct WaiterGuard<C: Transport> {
    inner: Arc<PoolInner<C>>,
    kp: Arc<KeyPool<C>>,
    rx: oneshot::Receiver<Handoff<C>>,
    done: bool,
}

impl<C: Transport> WaiterGuard<C> {
    async fn recv(&mut self) -> Option<Handoff<C>> {
        let handoff = (&mut self.rx).await.ok();
        self.done = true;
        handoff
    }
}

impl<C: Transport> Drop for WaiterGuard<C> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.rx.close();
        match self.rx.try_recv() {
            Ok(Handoff::Entry(id, _, _)) => {
                if let Some(conn) = self.inner.release_entry(&self.kp, id) {
                    close_detached(conn);
                }
            }
            Ok(Handoff::Retry) => self.kp.state.lock().wake_one(),
            Err(_) => {}
        }
    }
}

// =============================================================================
// Lease
// =============================================================================

/// Exclusive use of one pooled connection.
///
/// Settle it exactly once with [`release`](Self::release) or
/// [`force_close`](Self::force_close); later calls do nothing. Dropping an
/// unsettled lease destroys the connection.
pub struct PoolLease<C: Transport> {
    inner: Arc<PoolInner<C>>,
    kp: Arc<KeyPool<C>>,
    key: PoolKey,
    id: ConnectionId,
    conn: Arc<C>,
    activity: Arc<EntryActivity>,
    settled: AtomicBool,
}

impl<C: Transport> PoolLease<C> {
    fn new(
        inner: Arc<PoolInner<C>>,
        kp: Arc<KeyPool<C>>,
        key: PoolKey,
        id: ConnectionId,
        conn: Arc<C>,
        activity: Arc<EntryActivity>,
    ) -> Self {
        Self {
            inner,
            kp,
            key,
            id,
            conn,
            activity,
            settled: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Records text activity on the connection.
    pub fn touch_text(&self) {
        if !self.is_settled() {
            self.activity.touch();
        }
    }

    /// Returns the connection to the pool for reuse.
    pub async fn release(&self) {
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(key = %self.key, conn_id = self.id, "Releasing pooled connection");
        if let Some(conn) = self.inner.release_entry(&self.kp, self.id) {
            conn.close().await;
        }
    }

    /// Closes the connection and drops it from the pool.
    pub async fn force_close(&self) {
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(key = %self.key, conn_id = self.id, "Force-closing pooled connection");
        self.conn.close().await;
        self.inner.remove_entry(&self.kp, self.id);
    }
}

impl<C: Transport> Drop for PoolLease<C> {
    fn drop(&mut self) {
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(key = %self.key, conn_id = self.id, "Lease dropped without release, closing connection");
        self.inner.remove_entry(&self.kp, self.id);
        close_detached(self.conn.clone());
    }
}

impl<C: Transport> fmt::Debug for PoolLease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolLease")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Connection pool shared by every realtime session of a client.
///
/// The reaper task starts on the first acquisition and stops on
/// [`shutdown`](Self::shutdown) or when the pool is dropped.
pub struct ConnectionPool<C: Transport> {
    inner: Arc<PoolInner<C>>,
    reaper_started: AtomicBool,
}

impl<C: Transport> ConnectionPool<C> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config: config.normalized(),
                keys: Mutex::new(HashMap::new()),
                index: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
            reaper_started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquires a connection for `key`, dialing with `dial` when the key has
    /// spare capacity.
    ///
    /// Blocks while the key is at capacity. `cancel` (and the configured
    /// acquire timeout) bound only this call, not the returned lease.
    pub async fn acquire<F, Fut>(
        &self,
        key: &PoolKey,
        cancel: &CancellationToken,
        dial: F,
    ) -> Result<PoolLease<C>, PoolError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<C, TransportError>>,
    {
        self.ensure_reaper();
        match self.inner.config.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, self.acquire_inner(key, cancel, dial))
                .await
                .map_err(|_| {
                    warn!(key = %key, timeout_ms = limit.as_millis() as u64, "Connection acquisition timed out");
                    PoolError::Timeout(limit)
                })?,
            None => self.acquire_inner(key, cancel, dial).await,
        }
    }

    async fn acquire_inner<F, Fut>(
        &self,
        key: &PoolKey,
        cancel: &CancellationToken,
        mut dial: F,
    ) -> Result<PoolLease<C>, PoolError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<C, TransportError>>,
    {
        let kp = self.inner.key_pool(key);
        loop {
            if self.inner.shutdown.is_cancelled() {
                return Err(PoolError::ShutDown);
            }
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }

            let (step, evicted) = self.inner.try_acquire(key, &kp);
            if !evicted.is_empty() {
                self.inner.unindex(evicted.iter().map(|e| e.id));
                close_all(evicted.into_iter().map(|e| e.conn)).await;
            }

            match step {
                Step::Ready(lease) => return Ok(lease),
                Step::Dial => {
                    let reservation = DialReservation {
                        inner: self.inner.clone(),
                        kp: kp.clone(),
                        armed: true,
                    };
                    let dialed = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                        dialed = dial() => dialed,
                    };
                    return match dialed {
                        Ok(conn) => Ok(reservation.commit(key, conn)),
                        Err(e) => {
                            warn!(key = %key, error = %e, "Failed to dial pooled connection");
                            Err(PoolError::Dial(e))
                        }
                    };
                }
                Step::Wait(rx) => {
                    let mut waiter = WaiterGuard {
                        inner: self.inner.clone(),
                        kp: kp.clone(),
                        rx,
                        done: false,
                    };
                    let handoff = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                        handoff = waiter.recv() => handoff,
                    };
                    match handoff {
                        Some(Handoff::Entry(id, conn, activity)) => {
                            return Ok(PoolLease::new(
                                self.inner.clone(),
                                kp,
                                key.clone(),
                                id,
                                conn,
                                activity,
                            ));
                        }
                        Some(Handoff::Retry) | None => {
                            debug!(key = %key, "Waiter woken to retry acquisition");
                        }
                    }
                }
            }
        }
    }

    /// Marks text activity on a pooled connection.
    pub fn touch_text(&self, id: ConnectionId) {
        self.inner.touch_text(id);
    }

    pub fn stats(&self, key: &PoolKey) -> KeyPoolStats {
        let kp = self.inner.keys.lock().get(key).cloned();
        let Some(kp) = kp else {
            return KeyPoolStats::default();
        };
        let state = kp.state.lock();
        let busy = state.entries.iter().filter(|e| e.busy).count();
        KeyPoolStats {
            total: state.entries.len(),
            busy,
            idle: state.entries.len() - busy,
            dialing: state.dialing,
            waiters: state.waiters.iter().filter(|tx| !tx.is_closed()).count(),
        }
    }

    pub fn total_connections(&self) -> usize {
        self.inner
            .all_key_pools()
            .iter()
            .map(|(_, kp)| kp.state.lock().entries.len())
            .sum()
    }

    /// Stops the reaper, closes idle connections and fails pending and future
    /// acquisitions. Leased connections are closed when they are released.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let mut idle = Vec::new();
        for (_, kp) in self.inner.all_key_pools() {
            let mut state = kp.state.lock();
            let (busy, free): (Vec<_>, Vec<_>) =
                std::mem::take(&mut state.entries).into_iter().partition(|e| e.busy);
            state.entries = busy;
            idle.extend(free);
            while !state.waiters.is_empty() {
                state.wake_one();
            }
        }
        info!(closed = idle.len(), "Connection pool shut down");
        self.inner.unindex(idle.iter().map(|e| e.id));
        close_all(idle.into_iter().map(|e| e.conn)).await;
    }

    fn ensure_reaper(&self) {
        if self.reaper_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let stop = self.inner.shutdown.clone();
        let period = self.inner.config.reap_interval;
        tokio::spawn(reap_loop(weak, stop, period));
    }
}

impl<C: Transport> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn reap_loop<C: Transport>(
    inner: Weak<PoolInner<C>>,
    stop: CancellationToken,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(pool) = inner.upgrade() else {
            break;
        };
        let expired = pool.reap(Instant::now());
        drop(pool);
        close_all(expired).await;
    }
    debug!("Connection pool reaper stopped");
}
