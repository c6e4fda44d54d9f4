//! Connection pool.
//!
//! A bounded set of `Connection`s for one DSN, shared by many tasks.
//!
//! - `acquire` hands out an idle connection, opens a new one while below
//!   `max_size`, or queues the caller FIFO until one is released or the acquire
//!   timeout passes.
//! - Connections that go stale while idle are pinged before reuse. A failed ping
//!   breaks the connection and a replacement is tried once.
//! - Broken connections are never handed out again; they are closed on release and
//!   the pool is topped back up to `min_size` in the background.
//! - A background task closes connections idle longer than `idle_timeout` (never
//!   below `min_size`) and replenishes up to `min_size`.
//! - A connection whose operation was cut short by a dropped future (including
//!   an acquire cancelled mid health check) is treated as broken.
//!
//! All bookkeeping lives behind one `std::sync::Mutex` that is never held across an
//! `.await`; adapter I/O always runs outside it.

use super::adapter::AdapterFactory;
use super::connection::{Connection, ConnectionState};
use crate::config::PoolConfig;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Dsn};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const DEREF_ERR: &str = "PooledConnection used after release";

/// What a released resource becomes for the next waiter in line.
enum Grant {
    /// A ready connection, already counted as in use.
    Connection(Connection),
    /// Permission to open one new connection; already counted in `total`.
    Slot,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

#[derive(Default)]
struct PoolState {
    /// Released connections; pushed at the back, reused from the back, reaped from the front.
    idle: VecDeque<Connection>,
    /// Every connection that exists or is being opened or closed.
    total: usize,
    /// Checked out to callers.
    in_use: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    closed: bool,
    created: u64,
    disposed: u64,
}

impl PoolState {
    /// Give `grant` to the oldest live waiter; returns it if nobody took it.
    fn offer(&mut self, mut grant: Grant) -> Option<Grant> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(grant) {
                Ok(()) => return None,
                // Receiver gone (cancelled acquire); try the next one
                Err(returned) => grant = returned,
            }
        }
        Some(grant)
    }

    /// Place a usable connection: to a waiter if any, else onto the idle list.
    fn park(&mut self, mut conn: Connection, was_in_use: bool) {
        conn.set_state(ConnectionState::InUse);
        match self.offer(Grant::Connection(conn)) {
            None if !was_in_use => self.in_use += 1,
            None => {}
            Some(grant) => {
                if was_in_use {
                    self.in_use = self.in_use.saturating_sub(1);
                }
                if let Grant::Connection(mut conn) = grant {
                    conn.set_state(ConnectionState::Idle);
                    self.idle.push_back(conn);
                }
            }
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiters: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub closed: bool,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Connections closed by the pool (broken, reaped, or at shutdown).
    pub disposed: u64,
}

/// Result of an explicit health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    dsn: Dsn,
    factory: Arc<dyn AdapterFactory>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    /// Nudges the maintenance task (e.g. after a broken connection is disposed).
    wake: Arc<Notify>,
    /// Signalled when `total` reaches zero on a closed pool.
    drained: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Open one connection through the adapter factory. The caller must hold a slot.
    async fn open_connection(&self) -> DbResult<Connection> {
        let adapter = self.factory.open(&self.dsn, &self.config).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = id, db_type = %self.dsn.driver, "Opened connection");
        Ok(Connection::new(
            id,
            adapter,
            self.config.statement_cache_capacity,
            self.config.statement_timeout,
        ))
    }

    /// Return one unit of `total`: to a waiter as a slot, or drop it.
    fn retire_slot(&self) {
        let mut st = self.lock();
        self.retire_slot_locked(&mut st);
    }

    fn retire_slot_locked(&self, st: &mut PoolState) {
        if st.closed || st.offer(Grant::Slot).is_some() {
            st.total = st.total.saturating_sub(1);
            if st.closed && st.total == 0 {
                self.drained.notify_one();
            }
        }
    }

    /// Close `conn` off-lock, then free its slot.
    fn dispose(self: &Arc<Self>, mut conn: Connection) {
        match Handle::try_current() {
            Ok(handle) => {
                // Runs even if the task is dropped before it finishes
                let retire = RetireOnDrop(Arc::clone(self));
                handle.spawn(async move {
                    conn.close().await;
                    drop(retire);
                });
            }
            Err(_) => {
                drop(conn);
                self.finish_dispose();
            }
        }
    }

    fn finish_dispose(&self) {
        let mut st = self.lock();
        st.disposed += 1;
        self.retire_slot_locked(&mut st);
        let below_min = !st.closed && st.total < self.config.min_size;
        drop(st);
        if below_min {
            self.wake.notify_one();
        }
    }

    /// Take back a checked-out connection.
    pub(crate) fn release(self: &Arc<Self>, mut conn: Connection) {
        if conn.is_busy() {
            conn.mark_broken("released mid-operation");
        }
        let mut st = self.lock();
        if conn.is_broken() || conn.in_transaction() || st.closed {
            st.in_use = st.in_use.saturating_sub(1);
            drop(st);
            debug!(connection_id = conn.id(), state = %conn.state(), "Disposing connection");
            self.dispose(conn);
            return;
        }
        st.park(conn, true);
    }

    /// Get a connection without health checking it. The flag says whether it
    /// came from the idle list.
    async fn checkout(self: &Arc<Self>, deadline: Instant) -> DbResult<(Connection, bool)> {
        enum Step {
            Ready(Connection),
            Open,
            Wait(u64, oneshot::Receiver<Grant>),
        }

        let step = {
            let mut st = self.lock();
            if st.closed {
                return Err(DbError::PoolClosed);
            }
            if let Some(mut conn) = st.idle.pop_back() {
                st.in_use += 1;
                conn.set_state(ConnectionState::InUse);
                Step::Ready(conn)
            } else if st.total < self.config.max_size && st.waiters.is_empty() {
                st.total += 1;
                Step::Open
            } else {
                let (tx, rx) = oneshot::channel();
                st.next_waiter += 1;
                let id = st.next_waiter;
                st.waiters.push_back(Waiter { id, tx });
                Step::Wait(id, rx)
            }
        };

        match step {
            Step::Ready(conn) => Ok((conn, true)),
            Step::Open => self.open_reserved(deadline).await.map(|c| (c, false)),
            Step::Wait(id, rx) => {
                let grant = WaiterGuard::new(self, id, rx).wait(deadline).await?;
                match grant {
                    Grant::Connection(conn) => Ok((conn, false)),
                    Grant::Slot => self.open_reserved(deadline).await.map(|c| (c, false)),
                }
            }
        }
    }

    /// Open a connection into a slot this caller already holds.
    async fn open_reserved(self: &Arc<Self>, deadline: Instant) -> DbResult<Connection> {
        let mut slot = SlotGuard::new(self);

        let opened = tokio::time::timeout_at(deadline, self.open_connection())
            .await
            .map_err(|_| {
                DbError::connect(
                    format!("Timed out opening a {} connection", self.dsn.driver),
                    "Check that the database server is reachable or raise acquire_timeout",
                )
            })?;
        let mut conn = match opened {
            Ok(conn) => conn,
            Err(e) => {
                warn!(db_type = %self.dsn.driver, error = %e, "Failed to open connection");
                return Err(e);
            }
        };

        {
            let mut st = self.lock();
            if !st.closed {
                st.created += 1;
                st.in_use += 1;
                slot.disarm();
                conn.set_state(ConnectionState::InUse);
                return Ok(conn);
            }
        }
        conn.close().await;
        Err(DbError::PoolClosed)
    }

    /// Close idle connections past `idle_timeout`, keeping at least `min_size`.
    async fn reap_idle(&self) {
        let expired: Vec<Connection> = {
            let mut st = self.lock();
            let mut removable = st.total.saturating_sub(self.config.min_size);
            let mut kept = VecDeque::with_capacity(st.idle.len());
            let mut expired = Vec::new();
            while let Some(conn) = st.idle.pop_front() {
                if removable > 0 && conn.idle_for() >= self.config.idle_timeout {
                    removable -= 1;
                    expired.push(conn);
                } else {
                    kept.push_back(conn);
                }
            }
            st.idle = kept;
            expired
        };

        for mut conn in expired {
            debug!(connection_id = conn.id(), "Reaping idle connection");
            conn.close().await;
            let mut st = self.lock();
            st.disposed += 1;
            self.retire_slot_locked(&mut st);
        }
    }

    /// Open connections until `total` reaches `min_size`.
    async fn replenish(&self) -> DbResult<()> {
        let deficit = {
            let mut st = self.lock();
            if st.closed {
                return Ok(());
            }
            let deficit = self.config.min_size.saturating_sub(st.total);
            st.total += deficit;
            deficit
        };

        for attempt in 0..deficit {
            match self.open_connection().await {
                Ok(conn) => {
                    let leftover = {
                        let mut st = self.lock();
                        if st.closed {
                            Some(conn)
                        } else {
                            st.created += 1;
                            st.park(conn, false);
                            None
                        }
                    };
                    if let Some(mut conn) = leftover {
                        conn.close().await;
                        self.retire_slot();
                    }
                }
                Err(e) => {
                    // Give back this slot and the ones not yet attempted
                    for _ in attempt..deficit {
                        self.retire_slot();
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn run_maintenance(&self) {
        self.reap_idle().await;
        if let Err(e) = self.replenish().await {
            warn!(db_type = %self.dsn.driver, error = %e, "Failed to replenish pool");
        }
    }

    fn status(&self) -> PoolStatus {
        let st = self.lock();
        PoolStatus {
            total: st.total,
            idle: st.idle.len(),
            in_use: st.in_use,
            waiters: st.waiters.len(),
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            closed: st.closed,
            created: st.created,
            disposed: st.disposed,
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            handle.abort();
        }
    }
}

/// Finishes a disposal when dropped, whether or not the close ran.
struct RetireOnDrop(Arc<PoolInner>);

impl Drop for RetireOnDrop {
    fn drop(&mut self) {
        self.0.finish_dispose();
    }
}

/// Frees a reserved slot unless the open succeeded.
struct SlotGuard<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl<'a> SlotGuard<'a> {
    fn new(inner: &'a Arc<PoolInner>) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.retire_slot();
        }
    }
}

/// A queued acquire. Dropping it mid-wait withdraws it from the queue and returns
/// any grant that raced in.
struct WaiterGuard<'a> {
    inner: &'a Arc<PoolInner>,
    id: u64,
    rx: oneshot::Receiver<Grant>,
    done: bool,
}

impl<'a> WaiterGuard<'a> {
    fn new(inner: &'a Arc<PoolInner>, id: u64, rx: oneshot::Receiver<Grant>) -> Self {
        Self {
            inner,
            id,
            rx,
            done: false,
        }
    }

    /// Remove this waiter from the queue; false if it was already dequeued.
    fn withdraw(&self) -> bool {
        let mut st = self.inner.lock();
        match st.waiters.iter().position(|w| w.id == self.id) {
            Some(pos) => {
                st.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    async fn wait(mut self, deadline: Instant) -> DbResult<Grant> {
        let started = Instant::now();
        let outcome = tokio::time::timeout_at(deadline, &mut self.rx).await;
        self.done = true;
        match outcome {
            Ok(Ok(grant)) => Ok(grant),
            // Sender dropped: the pool closed while we waited
            Ok(Err(_)) => Err(DbError::PoolClosed),
            Err(_) => {
                if self.withdraw() {
                    debug!(waiter = self.id, "Acquire timed out");
                    return Err(DbError::pool_exhausted(
                        started.elapsed(),
                        self.inner.config.max_size,
                    ));
                }
                // Dequeued under the lock before we got it: the grant is already sent
                self.rx.try_recv().map_err(|_| DbError::PoolClosed)
            }
        }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.done || self.withdraw() {
            return;
        }
        match self.rx.try_recv() {
            Ok(Grant::Connection(conn)) => self.inner.release(conn),
            Ok(Grant::Slot) => self.inner.retire_slot(),
            Err(_) => {}
        }
    }
}

/// A bounded pool of connections to one database.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool and open `min_size` connections up front.
    ///
    /// Fails with the adapter's `ConnectError` if any of them cannot be opened.
    pub async fn connect(
        dsn: Dsn,
        config: PoolConfig,
        factory: Arc<dyn AdapterFactory>,
    ) -> DbResult<Self> {
        let pool = Self::connect_lazy(dsn, config, factory)?;
        if let Err(e) = pool.inner.replenish().await {
            pool.close().await;
            return Err(e);
        }
        info!(
            db_type = %pool.inner.dsn.driver,
            dsn = %pool.inner.dsn.masked(),
            min_size = pool.inner.config.min_size,
            max_size = pool.inner.config.max_size,
            "Connection pool ready"
        );
        Ok(pool)
    }

    /// Create a pool without opening any connection; they are opened on demand
    /// and by the background maintenance task.
    pub fn connect_lazy(
        dsn: Dsn,
        config: PoolConfig,
        factory: Arc<dyn AdapterFactory>,
    ) -> DbResult<Self> {
        config.validate()?;
        let inner = Arc::new(PoolInner {
            config,
            dsn,
            factory,
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(1),
            wake: Arc::new(Notify::new()),
            drained: Notify::new(),
            worker: Mutex::new(None),
        });

        let worker = Self::spawn_maintenance(&inner);
        *inner.worker.lock().unwrap_or_else(PoisonError::into_inner) = worker;
        Ok(Self { inner })
    }

    /// Start the reaper/replenisher.
    ///
    /// Holds only a `Weak` reference so the task exits once the pool is dropped.
    fn spawn_maintenance(inner: &Arc<PoolInner>) -> Option<JoinHandle<()>> {
        let handle = Handle::try_current().ok()?;
        let weak: Weak<PoolInner> = Arc::downgrade(inner);
        let wake = Arc::clone(&inner.wake);
        let period = inner.config.maintenance_interval;

        Some(handle.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = wake.notified() => {}
                }

                let Some(inner) = weak.upgrade() else {
                    debug!("Pool dropped, maintenance task exiting");
                    return;
                };
                if inner.is_closed() {
                    return;
                }
                inner.run_maintenance().await;
            }
        }))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn database_type(&self) -> DatabaseType {
        self.inner.dsn.driver
    }

    pub fn dsn(&self) -> &Dsn {
        &self.inner.dsn
    }

    /// Acquire a connection, waiting at most the configured `acquire_timeout`.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// Acquire a connection, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// - `PoolClosed` once `close()` has been called
    /// - `PoolExhausted` if no connection frees up in time
    /// - `ConnectError` if a new connection cannot be opened
    /// - `ConnectionBroken` if a stale connection and its replacement both fail
    ///   their health check
    pub async fn acquire_timeout(&self, timeout: Duration) -> DbResult<PooledConnection> {
        let deadline = Instant::now() + timeout;
        let mut failed_checks = 0;

        loop {
            let (conn, from_idle) = self.inner.checkout(deadline).await?;
            // Owned by the guard from here on, so a caller dropped mid-ping
            // still gives the slot back
            let mut conn = PooledConnection::new(conn, Arc::clone(&self.inner));

            let stale = from_idle
                && self.inner.config.health_check
                && conn.idle_for() >= self.inner.config.stale_after;
            if !stale || conn.ping(self.inner.config.health_check_timeout()).await {
                return Ok(conn);
            }

            let id = conn.id();
            conn.mark_broken("health check failed");
            conn.release().await;
            failed_checks += 1;
            if failed_checks > 1 {
                return Err(DbError::connection_broken(
                    id,
                    "health check failed on replacement connection",
                ));
            }
            debug!(connection_id = id, "Stale connection failed health check, retrying");
        }
    }

    /// Ping a checked-out connection; an unhealthy one is marked broken and will
    /// be disposed of on release.
    pub async fn health_check(&self, conn: &mut PooledConnection) -> Health {
        if conn.ping(self.inner.config.health_check_timeout()).await {
            Health::Healthy
        } else {
            conn.mark_broken("health check failed");
            Health::Unhealthy
        }
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Shut the pool down.
    ///
    /// New and queued acquires fail with `PoolClosed`. Idle connections are closed
    /// immediately; checked-out ones are closed as they are released, waiting up to
    /// `drain_timeout` for them. Idempotent.
    pub async fn close(&self) {
        let idle: Vec<Connection> = {
            let mut st = self.inner.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            // Dropping the senders wakes every waiter with PoolClosed
            st.waiters.clear();
            st.idle.drain(..).collect()
        };

        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            handle.abort();
        }

        info!(
            db_type = %self.inner.dsn.driver,
            idle = idle.len(),
            "Closing connection pool"
        );
        for mut conn in idle {
            conn.close().await;
            let mut st = self.inner.lock();
            st.disposed += 1;
            self.inner.retire_slot_locked(&mut st);
        }

        let deadline = Instant::now() + self.inner.config.drain_timeout;
        loop {
            let remaining = self.inner.lock().total;
            if remaining == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, self.inner.drained.notified())
                .await
                .is_err()
            {
                warn!(
                    remaining,
                    "Drain timeout elapsed with connections still checked out"
                );
                break;
            }
        }
        info!(db_type = %self.inner.dsn.driver, "Connection pool closed");
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("dsn", &self.inner.dsn.masked())
            .field("status", &self.status())
            .finish()
    }
}

/// A connection checked out of a pool.
///
/// Returned to the pool by `release()` or on drop. An open transaction is rolled
/// back first; if that fails the connection is disposed of instead of reused.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(conn: Connection, pool: Arc<PoolInner>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// Return the connection to the pool.
    ///
    /// Preferred over relying on Drop, which has to spawn a task when a
    /// transaction is still open.
    pub async fn release(mut self) {
        if let Some(mut conn) = self.conn.take() {
            rollback_if_open(&mut conn).await;
            self.pool.release(conn);
        }
    }
}

async fn rollback_if_open(conn: &mut Connection) {
    if !conn.in_transaction() || conn.is_busy() {
        return;
    }
    match conn.rollback().await {
        Ok(()) => info!(connection_id = conn.id(), "Rolled back abandoned transaction"),
        Err(e) => {
            warn!(connection_id = conn.id(), error = %e, "Rollback of abandoned transaction failed");
            conn.mark_broken("rollback failed");
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect(DEREF_ERR)
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect(DEREF_ERR)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        // An interrupted connection is disposed of by release
        if !conn.in_transaction() || conn.is_busy() {
            self.pool.release(conn);
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                // If the runtime is shutting down the task is dropped unpolled;
                // the guard then hands the connection back still in its
                // transaction, and release disposes of it.
                let mut guard = ReleaseOnDrop {
                    conn: Some(conn),
                    pool: Arc::clone(&self.pool),
                };
                handle.spawn(async move {
                    if let Some(conn) = guard.conn.as_mut() {
                        rollback_if_open(conn).await;
                    }
                    drop(guard);
                });
            }
            Err(_) => {
                conn.mark_broken("dropped outside a runtime with an open transaction");
                self.pool.release(conn);
            }
        }
    }
}

/// Returns its connection to the pool when dropped.
struct ReleaseOnDrop {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}
