#![forbid(unsafe_code)]

//! Bounded pool of file handles on the primary file.
//!
//! A connection is an open [`FileIo`] handle tagged with the store generation it was
//! opened under. Checkpoints replace the primary file and bump the generation, which
//! retires older handles the next time they are returned or checked.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::primitives::io::{FileIo, IoFactory};
use crate::types::{Result, TaskError};

/// Pool sizing and timeouts.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Connections kept open even when idle.
    pub min_size: usize,
    /// Upper bound on open connections.
    pub max_size: usize,
    /// How long `acquire` waits for a free connection.
    pub acquire_timeout: Duration,
    /// Idle connections above `min_size` are closed after this long.
    pub idle_timeout: Duration,
    /// How long opening a new connection may keep failing before giving up.
    pub connect_timeout: Duration,
    /// Callers allowed to queue; further callers fail immediately.
    pub max_waiting_clients: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(2),
            max_waiting_clients: 64,
        }
    }
}

impl PoolOptions {
    /// Checks the options are consistent.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(TaskError::Config("pool max_size must be at least 1".into()));
        }
        if self.min_size > self.max_size {
            return Err(TaskError::Config(format!(
                "pool min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Lifecycle notification for a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolEvent {
    /// A new connection was opened.
    Created {
        /// Connection id.
        id: u64,
    },
    /// A connection was handed to a caller.
    Active {
        /// Connection id.
        id: u64,
    },
    /// A connection was returned.
    Idle {
        /// Connection id.
        id: u64,
    },
    /// Opening or probing a connection failed.
    Error {
        /// Connection id, `None` when opening failed.
        id: Option<u64>,
        /// Failure description.
        message: String,
    },
    /// A connection was closed.
    Closed {
        /// Connection id.
        id: u64,
        /// Why it was closed.
        reason: &'static str,
    },
}

/// Callback for [`PoolEvent`]s. Runs under the pool lock and must not call back into
/// the pool.
pub type PoolListener = Arc<dyn Fn(&PoolEvent) + Send + Sync>;

/// Point-in-time pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Open connections, idle or in use.
    pub live: usize,
    /// Connections waiting in the pool.
    pub idle: usize,
    /// Connections held by callers.
    pub active: usize,
    /// Callers blocked in `acquire`.
    pub waiting: usize,
    /// Connections opened since start.
    pub created: u64,
    /// Connections closed since start.
    pub closed: u64,
    /// Acquires that gave up.
    pub timeouts: u64,
    /// Open or probe failures.
    pub errors: u64,
}

/// Result of [`ConnectionPool::health_check`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolHealth {
    /// Idle connections probed.
    pub checked: usize,
    /// Connections closed as stale or failing.
    pub closed: usize,
    /// Connections opened to restore `min_size`.
    pub created: usize,
}

/// An open handle on the primary file.
pub struct Connection {
    id: u64,
    io: Arc<dyn FileIo>,
    generation: u64,
    last_used: Instant,
    uses: u64,
    broken: bool,
}

impl Connection {
    /// Pool-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The file handle.
    pub fn io(&self) -> &Arc<dyn FileIo> {
        &self.io
    }

    /// Store generation the handle was opened under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Times the connection was handed out.
    pub fn uses(&self) -> u64 {
        self.uses
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("uses", &self.uses)
            .finish()
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Connection>,
    active: usize,
    opening: usize,
    waiting: usize,
    closed: bool,
    created: u64,
    closed_count: u64,
    timeouts: u64,
    errors: u64,
}

impl PoolState {
    fn live(&self) -> usize {
        self.idle.len() + self.active + self.opening
    }
}

struct PoolInner {
    path: PathBuf,
    factory: Arc<dyn IoFactory>,
    options: PoolOptions,
    state: Mutex<PoolState>,
    available: Condvar,
    generation: AtomicU64,
    next_id: AtomicU64,
    listener: Option<PoolListener>,
}

impl PoolInner {
    fn emit(&self, event: PoolEvent) {
        match &event {
            PoolEvent::Error { id, message } => {
                warn!(id = ?id, error = %message, "pool.connection.error")
            }
            PoolEvent::Closed { id, reason } => debug!(id, reason, "pool.connection.closed"),
            PoolEvent::Created { id } => debug!(id, "pool.connection.created"),
            PoolEvent::Active { id } => trace!(id, "pool.connection.active"),
            PoolEvent::Idle { id } => trace!(id, "pool.connection.idle"),
        }
        if let Some(listener) = &self.listener {
            listener(&event);
        }
    }

    fn retire(&self, state: &mut PoolState, conn: Connection, reason: &'static str) {
        state.closed_count += 1;
        self.emit(PoolEvent::Closed {
            id: conn.id,
            reason,
        });
    }

    /// Opens a handle, retrying until `connect_timeout` runs out. Called without the
    /// pool lock held.
    fn open_connection(&self) -> Result<Connection> {
        let started = Instant::now();
        let mut delay = Duration::from_millis(5);
        loop {
            // Tagged before the open: a checkpoint renaming the file mid-open leaves
            // this handle one generation behind, so it is retired instead of reused.
            let generation = self.generation.load(Ordering::Acquire);
            let attempt = self.factory.open(&self.path).and_then(|io| {
                io.len()?;
                Ok(io)
            });
            match attempt {
                Ok(io) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                    return Ok(Connection {
                        id,
                        io,
                        generation,
                        last_used: Instant::now(),
                        uses: 0,
                        broken: false,
                    });
                }
                Err(err) => {
                    let waited = started.elapsed();
                    if waited >= self.options.connect_timeout {
                        warn!(
                            path = %self.path.display(),
                            error = %err,
                            waited_ms = waited.as_millis() as u64,
                            "pool.connect.timeout"
                        );
                        return Err(TaskError::ConnectionTimeout {
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    let remaining = self.options.connect_timeout - waited;
                    thread::sleep(delay.min(remaining));
                    delay = (delay * 2).min(Duration::from_millis(100));
                }
            }
        }
    }

    fn is_current(&self, conn: &Connection) -> bool {
        conn.generation == self.generation.load(Ordering::Acquire)
    }

    fn release(&self, mut conn: Connection) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if state.closed {
            self.retire(&mut state, conn, "pool_closed");
        } else if conn.broken {
            self.retire(&mut state, conn, "broken");
        } else if !self.is_current(&conn) {
            self.retire(&mut state, conn, "stale_generation");
        } else {
            conn.last_used = Instant::now();
            let id = conn.id;
            state.idle.push_back(conn);
            self.emit(PoolEvent::Idle { id });
        }
        self.available.notify_one();
    }
}

/// Bounded, thread-safe pool of [`Connection`]s.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates the pool and opens `min_size` connections.
    pub fn open(
        path: &Path,
        options: PoolOptions,
        factory: Arc<dyn IoFactory>,
        listener: Option<PoolListener>,
    ) -> Result<Self> {
        options.validate()?;
        let pool = Self {
            inner: Arc::new(PoolInner {
                path: path.to_path_buf(),
                factory,
                options,
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
                generation: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                listener,
            }),
        };
        pool.fill_to_min()?;
        Ok(pool)
    }

    /// Options the pool was created with.
    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Acquires a connection, waiting up to the configured acquire timeout.
    pub fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_timeout(self.inner.options.acquire_timeout)
    }

    /// Acquires a connection, waiting up to `timeout`.
    ///
    /// Fails with [`TaskError::PoolExhausted`] when the wait queue is full or the
    /// timeout passes, and with [`TaskError::ConnectionTimeout`] when a new connection
    /// cannot be opened.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        let inner = &self.inner;
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = inner.state.lock();
        loop {
            if state.closed {
                return Err(TaskError::System("connection pool is closed".into()));
            }
            while let Some(mut conn) = state.idle.pop_back() {
                if !inner.is_current(&conn) {
                    inner.retire(&mut state, conn, "stale_generation");
                    continue;
                }
                conn.uses += 1;
                state.active += 1;
                inner.emit(PoolEvent::Active { id: conn.id });
                return Ok(self.wrap(conn));
            }
            if state.live() < inner.options.max_size {
                state.opening += 1;
                drop(state);
                let opened = inner.open_connection();
                state = inner.state.lock();
                state.opening -= 1;
                match opened {
                    Ok(mut conn) => {
                        state.created += 1;
                        inner.emit(PoolEvent::Created { id: conn.id });
                        if state.closed {
                            inner.retire(&mut state, conn, "pool_closed");
                            continue;
                        }
                        if !inner.is_current(&conn) {
                            inner.retire(&mut state, conn, "stale_generation");
                            continue;
                        }
                        conn.uses += 1;
                        state.active += 1;
                        inner.emit(PoolEvent::Active { id: conn.id });
                        return Ok(self.wrap(conn));
                    }
                    Err(err) => {
                        state.errors += 1;
                        inner.emit(PoolEvent::Error {
                            id: None,
                            message: err.to_string(),
                        });
                        inner.available.notify_one();
                        return Err(err);
                    }
                }
            }
            if state.waiting >= inner.options.max_waiting_clients {
                state.timeouts += 1;
                debug!(waiting = state.waiting, "pool.acquire.queue_full");
                return Err(TaskError::PoolExhausted {
                    waited_ms: started.elapsed().as_millis() as u64,
                    max_size: inner.options.max_size,
                });
            }
            state.waiting += 1;
            let timed_out = inner.available.wait_until(&mut state, deadline).timed_out();
            state.waiting -= 1;
            if timed_out && state.idle.is_empty() && state.live() >= inner.options.max_size {
                state.timeouts += 1;
                let waited_ms = started.elapsed().as_millis() as u64;
                debug!(waited_ms, "pool.acquire.timeout");
                return Err(TaskError::PoolExhausted {
                    waited_ms,
                    max_size: inner.options.max_size,
                });
            }
        }
    }

    /// Retires every connection opened before this call. Active ones close when
    /// returned.
    pub fn bump_generation(&self) -> u64 {
        let next = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut state = self.inner.state.lock();
        let stale: Vec<Connection> = state.idle.drain(..).collect();
        for conn in stale {
            self.inner.retire(&mut state, conn, "stale_generation");
        }
        drop(state);
        debug!(generation = next, "pool.generation.bump");
        next
    }

    /// Current store generation.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Closes idle connections unused for longer than the idle timeout, never going
    /// below `min_size`. Returns how many were closed.
    pub fn prune_idle(&self) -> usize {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let mut pruned = 0;
        let mut kept = VecDeque::with_capacity(state.idle.len());
        while let Some(conn) = state.idle.pop_front() {
            let excess = state.live() + kept.len() + 1 > inner.options.min_size;
            if excess && conn.last_used.elapsed() >= inner.options.idle_timeout {
                inner.retire(&mut state, conn, "idle_timeout");
                pruned += 1;
            } else {
                kept.push_back(conn);
            }
        }
        state.idle = kept;
        if pruned > 0 {
            debug!(pruned, live = state.live(), "pool.prune");
        }
        pruned
    }

    /// Probes idle connections, closes failing or stale ones and reopens up to
    /// `min_size`.
    pub fn health_check(&self) -> Result<PoolHealth> {
        let inner = &self.inner;
        let mut health = PoolHealth::default();
        {
            let mut state = inner.state.lock();
            let idle: Vec<Connection> = state.idle.drain(..).collect();
            for conn in idle {
                health.checked += 1;
                if !inner.is_current(&conn) {
                    inner.retire(&mut state, conn, "stale_generation");
                    health.closed += 1;
                    continue;
                }
                if let Err(err) = conn.io.len() {
                    state.errors += 1;
                    inner.emit(PoolEvent::Error {
                        id: Some(conn.id),
                        message: err.to_string(),
                    });
                    inner.retire(&mut state, conn, "probe_failed");
                    health.closed += 1;
                    continue;
                }
                state.idle.push_back(conn);
            }
        }
        health.created = self.fill_to_min()?;
        Ok(health)
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            live: state.idle.len() + state.active,
            idle: state.idle.len(),
            active: state.active,
            waiting: state.waiting,
            created: state.created,
            closed: state.closed_count,
            timeouts: state.timeouts,
            errors: state.errors,
        }
    }

    /// Stops handing out connections and closes idle ones. Outstanding connections
    /// close as they are returned.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let idle: Vec<Connection> = state.idle.drain(..).collect();
        for conn in idle {
            self.inner.retire(&mut state, conn, "pool_closed");
        }
        self.inner.available.notify_all();
        debug!(active = state.active, "pool.close");
    }

    fn fill_to_min(&self) -> Result<usize> {
        let inner = &self.inner;
        let needed = {
            let mut state = inner.state.lock();
            if state.closed {
                return Ok(0);
            }
            let needed = inner.options.min_size.saturating_sub(state.live());
            state.opening += needed;
            needed
        };
        let mut created = 0;
        let mut failure = None;
        for _ in 0..needed {
            match inner.open_connection() {
                Ok(conn) => {
                    let mut state = inner.state.lock();
                    state.opening -= 1;
                    state.created += 1;
                    created += 1;
                    inner.emit(PoolEvent::Created { id: conn.id });
                    let id = conn.id;
                    state.idle.push_back(conn);
                    inner.emit(PoolEvent::Idle { id });
                    inner.available.notify_one();
                }
                Err(err) => {
                    let mut state = inner.state.lock();
                    state.opening -= 1;
                    state.errors += 1;
                    inner.emit(PoolEvent::Error {
                        id: None,
                        message: err.to_string(),
                    });
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            let mut state = inner.state.lock();
            let remaining = needed - created - 1;
            state.opening -= remaining;
            return Err(err);
        }
        Ok(created)
    }

    fn wrap(&self, conn: Connection) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        }
    }
}

/// A connection on loan from the pool. Returned when dropped.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    /// Marks the connection unusable so it is closed instead of returned.
    pub fn mark_broken(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.broken = true;
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdIoFactory;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn options(max: usize) -> PoolOptions {
        PoolOptions {
            min_size: 1,
            max_size: max,
            acquire_timeout: Duration::from_millis(50),
            idle_timeout: Duration::from_millis(0),
            connect_timeout: Duration::from_millis(50),
            max_waiting_clients: 8,
        }
    }

    fn pool(max: usize) -> (tempfile::TempDir, ConnectionPool) {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::open(
            &dir.path().join("tasks.db"),
            options(max),
            Arc::new(StdIoFactory),
            None,
        )
        .unwrap();
        (dir, pool)
    }

    #[test]
    fn opens_min_connections_eagerly() {
        let (_dir, pool) = pool(2);
        let stats = pool.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.created, 1);
    }

    #[test]
    fn exhausted_pool_times_out_then_recovers() {
        let (_dir, pool) = pool(2);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, TaskError::PoolExhausted { max_size: 2, .. }));
        assert_eq!(pool.stats().timeouts, 1);
        drop(a);
        let c = pool.acquire().unwrap();
        assert_eq!(pool.stats().active, 2);
        drop(c);
    }

    #[test]
    fn full_wait_queue_fails_fast() {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::open(
            &dir.path().join("tasks.db"),
            PoolOptions {
                max_waiting_clients: 0,
                acquire_timeout: Duration::from_secs(30),
                ..options(1)
            },
            Arc::new(StdIoFactory),
            None,
        )
        .unwrap();
        let _held = pool.acquire().unwrap();
        let started = Instant::now();
        assert!(matches!(
            pool.acquire(),
            Err(TaskError::PoolExhausted { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn release_wakes_a_waiter() {
        let (_dir, pool) = pool(1);
        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire_timeout(Duration::from_secs(5)).map(|c| c.id()))
        };
        thread::sleep(Duration::from_millis(20));
        let id = held.id();
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), id);
    }

    #[test]
    fn generation_bump_retires_old_handles() {
        let (_dir, pool) = pool(2);
        let held = pool.acquire().unwrap();
        let old_id = held.id();
        assert_eq!(pool.bump_generation(), 1);
        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.closed, 1);
        let fresh = pool.acquire().unwrap();
        assert_ne!(fresh.id(), old_id);
        assert_eq!(fresh.generation(), 1);
    }

    #[test]
    fn prune_respects_min_size() {
        let (_dir, pool) = pool(3);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        drop((a, b, c));
        assert_eq!(pool.stats().idle, 3);
        assert_eq!(pool.prune_idle(), 2);
        assert_eq!(pool.stats().live, 1);
    }

    #[test]
    fn health_check_replaces_stale_connections() {
        let (_dir, pool) = pool(2);
        pool.bump_generation();
        assert_eq!(pool.stats().live, 0);
        let health = pool.health_check().unwrap();
        assert_eq!(health.created, 1);
        assert_eq!(pool.stats().idle, 1);
    }

    struct FailingFactory;

    impl IoFactory for FailingFactory {
        fn open(&self, _path: &Path) -> Result<Arc<dyn FileIo>> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked").into())
        }
    }

    #[test]
    fn failing_open_reports_connection_timeout() {
        let dir = tempdir().unwrap();
        let err = ConnectionPool::open(
            &dir.path().join("tasks.db"),
            options(1),
            Arc::new(FailingFactory),
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(err, TaskError::ConnectionTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn listener_sees_lifecycle() {
        let dir = tempdir().unwrap();
        let created = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(AtomicUsize::new(0));
        let listener: PoolListener = {
            let created = Arc::clone(&created);
            let idle = Arc::clone(&idle);
            Arc::new(move |event| match event {
                PoolEvent::Created { .. } => {
                    created.fetch_add(1, Ordering::SeqCst);
                }
                PoolEvent::Idle { .. } => {
                    idle.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            })
        };
        let pool = ConnectionPool::open(
            &dir.path().join("tasks.db"),
            options(2),
            Arc::new(StdIoFactory),
            Some(listener),
        )
        .unwrap();
        drop(pool.acquire().unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(idle.load(Ordering::SeqCst), 2);
    }
}
