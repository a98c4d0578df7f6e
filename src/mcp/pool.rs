//! Connection Pool
//!
//! Keeps a bounded set of live connections (normally initialized
//! [`McpClient`]s) per logical server. Callers borrow a connection with
//! [`ConnectionPool::acquire`] and must hand it back with
//! [`ConnectionPool::release`]; the pool owns every connection it created.
//!
//! Invariants:
//! - `active + idle <= max_connections` at all times. A creation slot is
//!   reserved under the pool lock before the factory runs.
//! - The pool never intentionally drops below `min_connections`: the health
//!   monitor task replaces broken connections and only evicts idle ones above
//!   the minimum.
//!
//! The pool lock is a plain `std::sync::Mutex` and is never held across an
//! `.await`; connection factories, health probes and `close()` calls all run
//! outside it.

use crate::mcp::client::McpClient;
use crate::mcp::error::{McpError, Result, POOL_EXHAUSTED};
use crate::mcp::lock;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Retry hint attached to pool exhaustion errors
const EXHAUSTED_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Number of samples kept for `average_acquire_time`
const ACQUIRE_SAMPLES: usize = 100;

/// How long `close()` waits for the health monitor to stop
const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection the pool can manage
#[async_trait]
pub trait PoolConnection: Send + Sync + 'static {
    /// Cheap liveness check used on acquire, release and by the monitor
    fn is_connected(&self) -> bool;

    /// Release the underlying resources (must be idempotent)
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl PoolConnection for McpClient {
    fn is_connected(&self) -> bool {
        McpClient::is_connected(self)
    }

    async fn close(&self) -> Result<()> {
        McpClient::close(self).await
    }
}

/// Creates one ready-to-use connection
pub type ConnectionFactory<C> = Arc<dyn Fn() -> BoxFuture<'static, Result<C>> + Send + Sync>;

/// Pool sizing and timing
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    /// Default `acquire()` budget; also bounds each factory call
    pub connection_timeout: Duration,
    /// Idle connections above the minimum are closed after this long
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

/// Snapshot of pool counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionPoolMetrics {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub total_acquires: u64,
    pub total_releases: u64,
    pub pool_exhausted_count: u64,
    /// Mean over the last 100 acquisitions
    pub average_acquire_time: Duration,
}

impl ConnectionPoolMetrics {
    pub fn to_json(&self) -> Value {
        json!({
            "total_connections": self.total_connections,
            "active_connections": self.active_connections,
            "idle_connections": self.idle_connections,
            "total_acquires": self.total_acquires,
            "total_releases": self.total_releases,
            "pool_exhausted_count": self.pool_exhausted_count,
            "average_acquire_time": self.average_acquire_time.as_secs_f64(),
        })
    }
}

/// A borrowed connection; give it back with [`ConnectionPool::release`]
///
/// Dropping it without releasing keeps its slot reserved until the pool is
/// closed.
pub struct PooledConnection<C> {
    id: u64,
    conn: Arc<C>,
}

impl<C> PooledConnection<C> {
    /// Pool-local identifier, stable across acquire/release cycles
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<C> std::ops::Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

struct IdleEntry<C> {
    id: u64,
    conn: Arc<C>,
    since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleEntry<C>>,
    in_use: HashMap<u64, Arc<C>>,
    /// Live connections plus reserved creation slots
    total_created: usize,
    next_id: u64,
    closed: bool,
    total_acquires: u64,
    total_releases: u64,
    exhausted_count: u64,
    acquire_times: VecDeque<Duration>,
}

impl<C> PoolState<C> {
    fn record_acquire(&mut self, id: u64, conn: Arc<C>, started: Instant) {
        self.in_use.insert(id, conn);
        self.total_acquires += 1;
        if self.acquire_times.len() == ACQUIRE_SAMPLES {
            self.acquire_times.pop_front();
        }
        self.acquire_times.push_back(started.elapsed());
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct PoolInner<C> {
    server_name: String,
    config: PoolConfig,
    factory: ConnectionFactory<C>,
    state: std::sync::Mutex<PoolState<C>>,
    /// Signalled whenever a connection or a creation slot frees up
    available: Notify,
}

/// Where `acquire()` goes next after inspecting the pool under the lock
enum Step<'a, C> {
    Reuse(IdleEntry<C>),
    Create,
    /// Registered under the lock, so no wakeup between unlock and wait is lost
    Wait(Notified<'a>),
}

impl<C: PoolConnection> PoolInner<C> {
    async fn create_connection(&self) -> Result<C> {
        let timeout = self.config.connection_timeout;
        match tokio::time::timeout(timeout, (self.factory)()).await {
            Ok(result) => result,
            Err(_) => Err(McpError::timeout(
                format!("Timed out creating connection for {}", self.server_name),
                timeout,
            )),
        }
    }

    /// Give a reserved creation slot back
    fn unreserve(&self) {
        let mut state = lock(&self.state);
        state.total_created = state.total_created.saturating_sub(1);
        drop(state);
        self.available.notify_waiters();
    }

    async fn discard(&self, id: u64, conn: &C) {
        if let Err(e) = conn.close().await {
            tracing::warn!("Error closing connection {} for {}: {}", id, self.server_name, e);
        }
    }

    /// Create connections until `total_created` reaches `min_connections`
    async fn replenish(&self) {
        loop {
            {
                let mut state = lock(&self.state);
                if state.closed || state.total_created >= self.config.min_connections {
                    return;
                }
                state.total_created += 1;
            }

            match self.create_connection().await {
                Ok(conn) => {
                    let conn = Arc::new(conn);
                    let added = {
                        let mut state = lock(&self.state);
                        if state.closed {
                            state.total_created = state.total_created.saturating_sub(1);
                            None
                        } else {
                            let id = state.allocate_id();
                            state.idle.push_back(IdleEntry {
                                id,
                                conn: conn.clone(),
                                since: Instant::now(),
                            });
                            Some(id)
                        }
                    };

                    match added {
                        Some(id) => {
                            tracing::debug!("Created connection {} for {}", id, self.server_name);
                            self.available.notify_waiters();
                        }
                        None => {
                            self.discard(0, &conn).await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to create connection for {}: {}", self.server_name, e);
                    self.unreserve();
                    return;
                }
            }
        }
    }

    /// One monitor pass: drop broken idle connections, expire idle ones above
    /// the minimum, then top the pool back up
    async fn check_health(&self) {
        let (drained, total) = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            (state.idle.drain(..).collect::<Vec<_>>(), state.total_created)
        };

        let mut keep = Vec::with_capacity(drained.len());
        let mut remaining = total;
        for entry in drained {
            if !entry.conn.is_connected() {
                tracing::warn!(
                    "Removing unhealthy connection {} from {}",
                    entry.id,
                    self.server_name
                );
                self.discard(entry.id, &entry.conn).await;
                remaining = remaining.saturating_sub(1);
            } else if entry.since.elapsed() > self.config.idle_timeout
                && remaining > self.config.min_connections
            {
                tracing::debug!(
                    "Closing idle connection {} for {} after {:?}",
                    entry.id,
                    self.server_name,
                    entry.since.elapsed()
                );
                self.discard(entry.id, &entry.conn).await;
                remaining = remaining.saturating_sub(1);
            } else {
                keep.push(entry);
            }
        }
        let removed = total - remaining;

        let orphaned = {
            let mut state = lock(&self.state);
            state.total_created = state.total_created.saturating_sub(removed);
            if state.closed {
                keep
            } else {
                // Entries released during the pass stay behind the survivors
                for entry in keep.into_iter().rev() {
                    state.idle.push_front(entry);
                }
                Vec::new()
            }
        };
        for entry in orphaned {
            self.discard(entry.id, &entry.conn).await;
        }
        // Waiters that parked while the idle queue was drained re-check now
        self.available.notify_waiters();

        self.replenish().await;
    }

    async fn monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!("Health monitor started for {}", self.server_name);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.health_check_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.check_health().await;
        }
        tracing::debug!("Health monitor stopped for {}", self.server_name);
    }
}

/// Bounded pool of connections to one MCP server
///
/// # Example
///
/// ```ignore
/// let pool = ConnectionPool::from_fn("github", PoolConfig::default(), || async {
///     let client = McpClient::new();
///     client.connect_stdio(&command, None, None, Duration::from_secs(30)).await?;
///     Ok(client)
/// })
/// .await;
///
/// let client = pool.acquire(None).await?;
/// let tools = client.list_tools().await;
/// pool.release(client).await;
/// ```
pub struct ConnectionPool<C: PoolConnection> {
    inner: Arc<PoolInner<C>>,
    shutdown: watch::Sender<bool>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<C: PoolConnection> ConnectionPool<C> {
    /// Create the pool, pre-create `min_connections` and start the monitor
    ///
    /// Pre-creation failures are logged; the monitor keeps retrying them.
    pub async fn new(
        server_name: impl Into<String>,
        config: PoolConfig,
        factory: ConnectionFactory<C>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            server_name: server_name.into(),
            config,
            factory,
            state: std::sync::Mutex::new(PoolState {
                idle: VecDeque::new(),
                in_use: HashMap::new(),
                total_created: 0,
                next_id: 0,
                closed: false,
                total_acquires: 0,
                total_releases: 0,
                exhausted_count: 0,
                acquire_times: VecDeque::with_capacity(ACQUIRE_SAMPLES),
            }),
            available: Notify::new(),
        });

        inner.replenish().await;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let monitor = tokio::spawn(inner.clone().monitor(shutdown_rx));

        tracing::info!(
            "Connection pool initialized for {}: min={}, max={}",
            inner.server_name,
            inner.config.min_connections,
            inner.config.max_connections
        );

        Self {
            inner,
            shutdown,
            monitor: std::sync::Mutex::new(Some(monitor)),
        }
    }

    /// Like [`ConnectionPool::new`], boxing a plain async closure
    pub async fn from_fn<F, Fut>(server_name: impl Into<String>, config: PoolConfig, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C>> + Send + 'static,
    {
        let factory: ConnectionFactory<C> =
            Arc::new(move || -> BoxFuture<'static, Result<C>> { Box::pin(f()) });
        Self::new(server_name, config, factory).await
    }

    pub fn server_name(&self) -> &str {
        &self.inner.server_name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow a connection, waiting up to `timeout` (default
    /// `connection_timeout`) for one to free up
    ///
    /// Idle connections that are no longer connected are closed and skipped.
    /// Fails with a `Connection` error (`POOL_EXHAUSTED`, retry after 5 s)
    /// when the pool is at capacity for the whole budget.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<PooledConnection<C>> {
        let inner = &self.inner;
        let started = Instant::now();
        let budget = timeout.unwrap_or(inner.config.connection_timeout);
        let deadline = started + budget;

        loop {
            let step = {
                let mut state = lock(&inner.state);
                if state.closed {
                    return Err(McpError::connection("Connection pool is closed"));
                }
                if let Some(entry) = state.idle.pop_front() {
                    Step::Reuse(entry)
                } else if state.total_created < inner.config.max_connections {
                    state.total_created += 1;
                    Step::Create
                } else {
                    Step::Wait(inner.available.notified())
                }
            };

            match step {
                Step::Reuse(entry) => {
                    if entry.conn.is_connected() {
                        let acquired = {
                            let mut state = lock(&inner.state);
                            if state.closed {
                                false
                            } else {
                                state.record_acquire(entry.id, entry.conn.clone(), started);
                                tracing::debug!(
                                    "Acquired connection {} from {} ({} in use)",
                                    entry.id,
                                    inner.server_name,
                                    state.in_use.len()
                                );
                                true
                            }
                        };
                        if acquired {
                            return Ok(PooledConnection {
                                id: entry.id,
                                conn: entry.conn,
                            });
                        }

                        // close() ran while the entry was being checked
                        inner.discard(entry.id, &entry.conn).await;
                        return Err(McpError::connection("Connection pool is closed"));
                    }

                    tracing::warn!(
                        "Discarding unhealthy connection {} from {}",
                        entry.id,
                        inner.server_name
                    );
                    inner.discard(entry.id, &entry.conn).await;
                    inner.unreserve();

                    if Instant::now() >= deadline {
                        return Err(McpError::connection("Timeout acquiring healthy connection"));
                    }
                }
                Step::Create => {
                    let conn = match inner.create_connection().await {
                        Ok(conn) => Arc::new(conn),
                        Err(e) => {
                            inner.unreserve();
                            return Err(e);
                        }
                    };

                    let created = {
                        let mut state = lock(&inner.state);
                        if state.closed {
                            state.total_created = state.total_created.saturating_sub(1);
                            None
                        } else {
                            let id = state.allocate_id();
                            state.record_acquire(id, conn.clone(), started);
                            tracing::info!(
                                "Created connection {} for {} ({}/{})",
                                id,
                                inner.server_name,
                                state.total_created,
                                inner.config.max_connections
                            );
                            Some(id)
                        }
                    };

                    return match created {
                        Some(id) => Ok(PooledConnection { id, conn }),
                        None => {
                            inner.discard(0, &conn).await;
                            Err(McpError::connection("Connection pool is closed"))
                        }
                    };
                }
                Step::Wait(notified) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let woke = !remaining.is_zero()
                        && tokio::time::timeout(remaining, notified).await.is_ok();
                    if woke {
                        continue;
                    }

                    lock(&inner.state).exhausted_count += 1;
                    tracing::warn!(
                        "Connection pool exhausted for {} (max {})",
                        inner.server_name,
                        inner.config.max_connections
                    );
                    return Err(McpError::connection(format!(
                        "Connection pool exhausted for {}. Max connections: {}. \
                         Try again later or increase max_connections.",
                        inner.server_name, inner.config.max_connections
                    ))
                    .with_code(POOL_EXHAUSTED)
                    .with_retry_after(EXHAUSTED_RETRY_AFTER));
                }
            }
        }
    }

    /// Return a borrowed connection
    ///
    /// Healthy connections go back to the idle queue; broken ones are closed
    /// and their slot freed. Connections that do not belong to this pool are
    /// ignored.
    pub async fn release(&self, conn: PooledConnection<C>) {
        let inner = &self.inner;
        let PooledConnection { id, conn } = conn;

        let closed = {
            let mut state = lock(&inner.state);
            if state.in_use.remove(&id).is_none() {
                tracing::warn!(
                    "Ignoring release of unknown connection {} for {}",
                    id,
                    inner.server_name
                );
                return;
            }
            state.total_releases += 1;
            state.closed
        };
        if closed {
            inner.discard(id, &conn).await;
            return;
        }

        if conn.is_connected() {
            let overflow = {
                let mut state = lock(&inner.state);
                if state.closed {
                    true
                } else if state.idle.len() < inner.config.max_connections {
                    state.idle.push_back(IdleEntry {
                        id,
                        conn: conn.clone(),
                        since: Instant::now(),
                    });
                    false
                } else {
                    state.total_created = state.total_created.saturating_sub(1);
                    true
                }
            };

            if overflow {
                tracing::debug!("Pool full for {}, closing connection {}", inner.server_name, id);
                inner.discard(id, &conn).await;
            } else {
                tracing::debug!("Released connection {} to {}", id, inner.server_name);
                inner.available.notify_waiters();
            }
        } else {
            tracing::warn!(
                "Closing unhealthy connection {} released to {}",
                id,
                inner.server_name
            );
            inner.discard(id, &conn).await;
            inner.unreserve();
        }
    }

    /// Close every idle and borrowed connection and stop the monitor
    ///
    /// Later `acquire()` calls fail immediately; pending ones are woken and
    /// fail too.
    pub async fn close(&self) {
        let inner = &self.inner;
        let _ = self.shutdown.send(true);

        let (idle, in_use) = {
            let mut state = lock(&inner.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.total_created = 0;
            let idle: Vec<_> = state.idle.drain(..).collect();
            let in_use: Vec<_> = state.in_use.drain().collect();
            (idle, in_use)
        };
        inner.available.notify_waiters();

        for entry in idle {
            inner.discard(entry.id, &entry.conn).await;
        }
        for (id, conn) in in_use {
            inner.discard(id, &conn).await;
        }

        let monitor = lock(&self.monitor).take();
        if let Some(handle) = monitor {
            if tokio::time::timeout(MONITOR_JOIN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("Health monitor for {} did not stop in time", inner.server_name);
            }
        }

        tracing::info!("Connection pool closed for {}", inner.server_name);
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    pub fn metrics(&self) -> ConnectionPoolMetrics {
        let state = lock(&self.inner.state);
        let average_acquire_time = if state.acquire_times.is_empty() {
            Duration::ZERO
        } else {
            state.acquire_times.iter().sum::<Duration>() / state.acquire_times.len() as u32
        };

        ConnectionPoolMetrics {
            total_connections: state.total_created,
            active_connections: state.in_use.len(),
            idle_connections: state.idle.len(),
            total_acquires: state.total_acquires,
            total_releases: state.total_releases,
            pool_exhausted_count: state.exhausted_count,
            average_acquire_time,
        }
    }
}

impl<C: PoolConnection> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.monitor).take() {
            handle.abort();
        }
    }
}
