//! Database proxy shim: connection pool manager.
//!
//! Owns the physical connections behind the guest-visible `connect`/`send`/
//! `recv`/`close` calls. Connections are pooled per
//! `(protocol, host, port, database, user)` and exposed to guest modules via
//! generation-tagged `u64` handles (see [`registry`]).
//!
//! # Architecture
//!
//! ```text
//! Guest calls connect(config)
//!   → config.validate()                        (InvalidConfig, no I/O)
//!   → ConnectionPoolManager locks the pool for the key
//!     → idle connection available → probe → handle
//!     → under capacity → reserve slot → dial + handshake → handle
//!     → at capacity → PoolExhausted (never queued)
//! Guest calls close(handle)
//!   → registry drops the handle → probe → back to idle, or discard
//! ```
//!
//! Each key has its own lock, so unrelated pools never contend. No lock is
//! held across socket I/O: probes, dials and passthrough calls run on the
//! blocking pool with only the connection's own cell locked.

pub mod factory;
pub mod host;
pub mod maintenance;
pub mod mysql;
pub mod postgres;
pub mod redis;
pub mod registry;
pub mod tcp;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, RwLock};
use warp_core::{ConnectConfig, DbProxyError, Protocol};

pub use registry::{HandleRegistry, InstanceId};

use registry::Entry;

/// Key identifying a connection pool. Connections with the same key share a pool.
///
/// The user is part of the key: an authenticated socket is never handed to a
/// caller presenting different credentials.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub protocol: Protocol,
}

impl PoolKey {
    pub fn new(host: &str, port: u16, database: &str, user: &str) -> Self {
        Self::with_protocol(host, port, database, user, Protocol::default())
    }

    /// Create a pool key with an explicit protocol discriminator.
    pub fn with_protocol(
        host: &str,
        port: u16,
        database: &str,
        user: &str,
        protocol: Protocol,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            database: database.to_string(),
            user: user.to_string(),
            protocol,
        }
    }
}

impl From<&ConnectConfig> for PoolKey {
    fn from(config: &ConnectConfig) -> Self {
        Self::with_protocol(
            &config.host,
            config.port,
            &config.database,
            &config.user,
            config.protocol,
        )
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}@{}:{}/{}",
            self.protocol, self.user, self.host, self.port, self.database
        )
    }
}

/// Configuration for the connection pool manager.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Host-wide ceiling on connections per pool key (default: 10). A
    /// guest's `pool_size` is clamped to this.
    pub max_size: usize,
    /// Idle connections unused for longer than this are reaped (default: 60s).
    pub idle_timeout: Duration,
    /// Period of the background reap + probe sweep (default: 30s).
    pub health_check_interval: Duration,
    /// Deadline for dialing and authenticating a new connection (default: 5s).
    pub connect_timeout: Duration,
    /// Deadline for a single `recv` on a checked-out connection (default: 30s).
    pub recv_timeout: Duration,
    /// Deadline for one liveness probe (default: 2s).
    pub probe_timeout: Duration,
    /// Probe idle connections before handing them out (default: true).
    pub probe_on_checkout: bool,
    /// Probe connections when they are closed by the guest (default: true).
    pub probe_on_checkin: bool,
    /// Whether to use TLS for connections (default: false).
    pub use_tls: bool,
    /// Whether to verify TLS certificates (default: true).
    pub verify_certificates: bool,
    /// How long `drain()` waits for checked-out connections (default: 30s).
    pub drain_timeout: Duration,
    /// Upper bound on one backend frame and on one `recv` (default: 64 MiB).
    pub max_frame_size: usize,
    /// Authenticate Postgres sockets on the host (default: true). When false
    /// the guest drives the startup exchange over a raw socket.
    pub host_handshake: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            idle_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            probe_on_checkout: true,
            probe_on_checkin: true,
            use_tls: false,
            verify_certificates: true,
            drain_timeout: Duration::from_secs(30),
            max_frame_size: warpgrid_pgwire::DEFAULT_MAX_FRAME_SIZE,
            host_handshake: true,
        }
    }
}

/// Trait abstracting the underlying transport for testability.
///
/// All methods block; the manager calls them from the blocking pool.
pub trait ConnectionBackend: Send + std::fmt::Debug {
    /// Send bytes over the connection. Returns bytes sent.
    fn send(&mut self, data: &[u8]) -> Result<usize, DbProxyError>;
    /// Receive up to `max_bytes` from the connection. Empty means EOF.
    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, DbProxyError>;
    /// Liveness probe bounded by `timeout`. Returns `true` if the connection
    /// can be handed to another caller.
    fn ping(&mut self, timeout: Duration) -> bool;
    /// Close the underlying transport.
    fn close(&mut self);
    /// Whether the host completed the protocol handshake on this socket.
    fn authenticated(&self) -> bool {
        false
    }
    /// Return the session to the state the pool handed out, before the
    /// socket goes back to the idle set. `false` means the socket cannot be
    /// shared with another guest and must be discarded.
    ///
    /// By default only sockets the host logged in itself are reusable: a
    /// guest-driven handshake leaves that guest's login on the socket.
    fn reset_session(&mut self, _timeout: Duration) -> bool {
        self.authenticated()
    }
    /// Override the read deadline; `None` restores the configured one.
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> Result<(), DbProxyError> {
        Ok(())
    }
}

/// Factory for creating new connections, injected so tests can swap transports.
pub trait ConnectionFactory: Send + Sync {
    /// Dial and, where the protocol calls for it, authenticate.
    fn connect(
        &self,
        key: &PoolKey,
        password: Option<&str>,
    ) -> Result<Box<dyn ConnectionBackend>, DbProxyError>;
}

/// Lifecycle state of a pooled connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    CheckedOut,
    Closed,
}

/// A pooled connection with tracking metadata.
#[derive(Debug)]
pub struct PooledConnection {
    /// Unique ID for this physical connection.
    pub id: u64,
    pub key: PoolKey,
    pub state: ConnState,
    pub created_at: Instant,
    /// When this connection was last returned to the pool or handed out.
    pub last_used: Instant,
    /// Cleared on any I/O error or EOF; an unhealthy connection is never
    /// returned to the idle set.
    pub healthy: bool,
    backend: Box<dyn ConnectionBackend>,
}

impl PooledConnection {
    pub fn authenticated(&self) -> bool {
        self.backend.authenticated()
    }

    fn shut(&mut self) {
        self.backend.close();
        self.state = ConnState::Closed;
    }
}

/// A checked-out connection, shared between the registry and in-flight
/// calls. `None` once the connection has been checked back in.
pub(crate) type ConnCell = Arc<Mutex<Option<PooledConnection>>>;

/// Per-key pool: idle connections plus the count of every live socket.
#[derive(Debug)]
struct Pool {
    idle: VecDeque<PooledConnection>,
    /// Idle + checked out + currently dialing.
    total: usize,
    capacity: usize,
    exhausted_count: u64,
    /// Idle connections taken out by the sweep for probing. Still counted
    /// in `total`; checkouts wait for them instead of failing.
    probing: usize,
}

impl Pool {
    fn new(capacity: usize) -> Self {
        Self {
            idle: VecDeque::new(),
            total: 0,
            capacity,
            exhausted_count: 0,
            probing: 0,
        }
    }
}

/// Pool-level statistics for a single pool key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently checked out by guests.
    pub active: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Total connections (active + idle).
    pub total: usize,
    /// Number of checkouts rejected with `PoolExhausted`.
    pub exhausted_count: u64,
}

/// Whether the peer is still sending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvStatus {
    Open,
    /// The peer closed its side; no more bytes will arrive.
    PeerClosed,
}

/// Result of a `recv` together with its stream status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Received {
    pub data: Vec<u8>,
    pub status: RecvStatus,
}

enum Acquire {
    Idle(PooledConnection),
    Dial,
    /// The pool is full but the sweep holds an idle connection.
    Wait,
}

/// Manages connection pools keyed by `(protocol, host, port, database, user)`.
///
/// Each unique key gets its own bounded pool behind its own lock.
/// Connections are reused when returned via `release()` and reaped when idle
/// too long.
///
/// Supports connection draining on shutdown: calling `drain()` stops
/// accepting new connections while allowing in-flight operations to
/// complete up to the configured drain timeout.
pub struct ConnectionPoolManager {
    pools: RwLock<HashMap<PoolKey, Arc<Mutex<Pool>>>>,
    registry: Mutex<HandleRegistry>,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    /// When true, new `checkout()` calls are rejected.
    draining: AtomicBool,
    next_conn_id: AtomicU64,
    next_instance: AtomicU64,
    /// Woken whenever the sweep finishes probing a connection.
    probed: Notify,
}

impl ConnectionPoolManager {
    /// Create a new `ConnectionPoolManager` with the given configuration and factory.
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            registry: Mutex::new(HandleRegistry::new()),
            config,
            factory,
            draining: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            next_instance: AtomicU64::new(1),
            probed: Notify::new(),
        }
    }

    /// Build a manager whose factory dispatches on each key's protocol.
    pub fn from_config(config: PoolConfig) -> Result<Self, DbProxyError> {
        let factory = factory::ProtocolConnectionFactory::from_pool_config(&config)?;
        Ok(Self::new(config, Arc::new(factory)))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Allocate an owner id for a new guest instance.
    pub fn register_instance(&self) -> InstanceId {
        self.next_instance.fetch_add(1, Ordering::Relaxed)
    }

    /// Check if the pool manager is currently draining connections.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Number of handles currently open for `owner`.
    pub async fn open_handles(&self, owner: InstanceId) -> usize {
        self.registry.lock().await.count_owned_by(owner)
    }

    async fn pool(&self, key: &PoolKey) -> Option<Arc<Mutex<Pool>>> {
        self.pools.read().await.get(key).cloned()
    }

    async fn pool_or_create(&self, key: &PoolKey, pool_size: u32) -> Arc<Mutex<Pool>> {
        if let Some(pool) = self.pool(key).await {
            return pool;
        }
        let capacity = (pool_size as usize).min(self.config.max_size);
        let mut pools = self.pools.write().await;
        Arc::clone(
            pools
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Pool::new(capacity)))),
        )
    }

    async fn snapshot(&self) -> Vec<(PoolKey, Arc<Mutex<Pool>>)> {
        self.pools
            .read()
            .await
            .iter()
            .map(|(key, pool)| (key.clone(), Arc::clone(pool)))
            .collect()
    }

    /// Check out a connection for `config` on behalf of `owner`.
    ///
    /// An idle connection is reused if it passes a liveness probe; otherwise
    /// a new one is dialed if the pool is under capacity. A full pool fails
    /// immediately with `PoolExhausted`.
    pub async fn checkout(
        &self,
        owner: InstanceId,
        config: &ConnectConfig,
    ) -> Result<u64, DbProxyError> {
        config.validate()?;
        if self.is_draining() {
            return Err(DbProxyError::ConnectionRefused(
                "connection pool is draining".into(),
            ));
        }

        let key = PoolKey::from(config);
        let pool = self.pool_or_create(&key, config.pool_size).await;

        let (mut conn, reused) = loop {
            // Registered before the pool is inspected so a sweep finishing
            // in between still wakes this checkout.
            let probed = self.probed.notified();
            let step = {
                let mut p = pool.lock().await;
                if let Some(conn) = p.idle.pop_back() {
                    Acquire::Idle(conn)
                } else if p.total < p.capacity {
                    p.total += 1;
                    Acquire::Dial
                } else if p.probing > 0 {
                    Acquire::Wait
                } else {
                    p.exhausted_count += 1;
                    return Err(DbProxyError::PoolExhausted(format!(
                        "{key} ({}/{} connections in use)",
                        p.total, p.capacity
                    )));
                }
            };

            match step {
                Acquire::Wait => {
                    tracing::debug!(%key, "pool full while the sweep holds idle connections");
                    let _ = tokio::time::timeout(self.probe_deadline(), probed).await;
                }
                Acquire::Idle(conn) => {
                    let conn = if self.config.probe_on_checkout {
                        self.probe(conn).await
                    } else {
                        Some(conn)
                    };
                    match conn {
                        Some(conn) => break (conn, true),
                        None => {
                            tracing::debug!(%key, "discarded dead idle connection on checkout");
                            release_slot(&pool).await;
                        }
                    }
                }
                Acquire::Dial => match self.dial(&key, config.password.clone()).await {
                    Ok(conn) => break (conn, false),
                    Err(e) => {
                        release_slot(&pool).await;
                        tracing::debug!(%key, error = %e, "failed to open connection");
                        return Err(e);
                    }
                },
            }
        };

        conn.state = ConnState::CheckedOut;
        conn.last_used = Instant::now();
        let conn_id = conn.id;
        let cell: ConnCell = Arc::new(Mutex::new(Some(conn)));

        let inserted = self
            .registry
            .lock()
            .await
            .insert(owner, key.clone(), Arc::clone(&cell));
        let handle = match inserted {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(mut conn) = cell.lock().await.take() {
                    conn.shut();
                }
                release_slot(&pool).await;
                return Err(e);
            }
        };

        tracing::debug!(
            handle = handle,
            conn_id = conn_id,
            instance = owner,
            host = %key.host,
            port = key.port,
            database = %key.database,
            protocol = %key.protocol,
            reused = reused,
            "checked out connection"
        );
        Ok(handle)
    }

    async fn dial(
        &self,
        key: &PoolKey,
        password: Option<String>,
    ) -> Result<PooledConnection, DbProxyError> {
        let factory = Arc::clone(&self.factory);
        let target = key.clone();
        let task =
            tokio::task::spawn_blocking(move || factory.connect(&target, password.as_deref()));

        let backend = match tokio::time::timeout(self.config.connect_timeout, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => {
                return Err(DbProxyError::ConnectionRefused(format!(
                    "connect task failed: {e}"
                )));
            }
            Err(_) => {
                return Err(DbProxyError::Timeout(format!(
                    "connecting to {}:{} took longer than {:?}",
                    key.host, key.port, self.config.connect_timeout
                )));
            }
        };

        let now = Instant::now();
        Ok(PooledConnection {
            id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            key: key.clone(),
            state: ConnState::Idle,
            created_at: now,
            last_used: now,
            healthy: true,
            backend,
        })
    }

    /// Outer bound on one probe or session reset. Backends enforce
    /// `probe_timeout` per round trip; this catches one that ignores it.
    fn probe_deadline(&self) -> Duration {
        self.config.probe_timeout * 4
    }

    /// Probe a connection off the async workers. Dead connections are
    /// closed and `None` is returned.
    async fn probe(&self, conn: PooledConnection) -> Option<PooledConnection> {
        self.vet(conn, false, true).await
    }

    /// Optionally reset the session, then optionally ping, on the blocking
    /// pool. A conn stuck in the task is dropped when the task ends.
    async fn vet(
        &self,
        mut conn: PooledConnection,
        reset: bool,
        ping: bool,
    ) -> Option<PooledConnection> {
        if !conn.healthy {
            conn.shut();
            return None;
        }
        let probe_timeout = self.config.probe_timeout;
        let task = tokio::task::spawn_blocking(move || {
            let ok = (!reset || conn.backend.reset_session(probe_timeout))
                && (!ping || conn.backend.ping(probe_timeout));
            if ok {
                Some(conn)
            } else {
                conn.shut();
                None
            }
        });
        match tokio::time::timeout(self.probe_deadline(), task).await {
            Ok(Ok(conn)) => conn,
            _ => None,
        }
    }

    async fn cell(&self, handle: u64) -> Result<ConnCell, DbProxyError> {
        let registry = self.registry.lock().await;
        Ok(Arc::clone(&registry.get(handle)?.conn))
    }

    /// Run `op` against the connection behind `handle` on the blocking pool.
    /// Any error marks the connection unhealthy.
    async fn with_conn<T, F>(&self, handle: u64, op: &'static str, f: F) -> Result<T, DbProxyError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PooledConnection) -> Result<T, DbProxyError> + Send + 'static,
    {
        let cell = self.cell(handle).await?;
        let mut guard = cell.lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let conn = guard
                .as_mut()
                .ok_or_else(|| DbProxyError::Closed(format!("handle {handle} is closed")))?;
            let result = f(conn);
            conn.last_used = Instant::now();
            if result.is_err() {
                conn.healthy = false;
            }
            result
        })
        .await
        .map_err(|e| DbProxyError::Closed(format!("{op} task failed: {e}")))?
    }

    /// Send data through a checked-out connection.
    pub async fn send(&self, handle: u64, data: &[u8]) -> Result<usize, DbProxyError> {
        let data = data.to_vec();
        let sent = self
            .with_conn(handle, "send", move |conn| conn.backend.send(&data))
            .await?;
        tracing::debug!(handle = handle, bytes = sent, "forwarded bytes to database");
        Ok(sent)
    }

    /// Receive data from a checked-out connection.
    pub async fn recv(&self, handle: u64, max_bytes: usize) -> Result<Vec<u8>, DbProxyError> {
        Ok(self.recv_with_status(handle, max_bytes).await?.data)
    }

    /// Receive data and report whether the peer has closed the stream.
    ///
    /// Blocks until at least one byte arrives, the peer closes, or
    /// `recv_timeout` passes (`Timeout`). `max_bytes` is capped at
    /// `max_frame_size`.
    pub async fn recv_with_status(
        &self,
        handle: u64,
        max_bytes: usize,
    ) -> Result<Received, DbProxyError> {
        let max = max_bytes.min(self.config.max_frame_size);
        let received = self
            .with_conn(handle, "recv", move |conn| {
                if max == 0 {
                    return Ok(Received {
                        data: Vec::new(),
                        status: RecvStatus::Open,
                    });
                }
                let data = conn.backend.recv(max)?;
                let status = if data.is_empty() {
                    conn.healthy = false;
                    RecvStatus::PeerClosed
                } else {
                    RecvStatus::Open
                };
                Ok(Received { data, status })
            })
            .await?;
        tracing::debug!(
            handle = handle,
            bytes = received.data.len(),
            status = ?received.status,
            "forwarded bytes from database"
        );
        Ok(received)
    }

    /// Release a connection back to the pool.
    ///
    /// The handle is invalid afterwards whatever happens to the socket. A
    /// second release of the same handle fails with `Closed`.
    pub async fn release(&self, handle: u64) -> Result<(), DbProxyError> {
        let entry = self.registry.lock().await.remove(handle)?;
        self.check_in(handle, entry).await;
        Ok(())
    }

    /// Return a connection to its pool's idle set, or discard it.
    async fn check_in(&self, handle: u64, entry: Entry) {
        let Some(mut conn) = entry.conn.lock().await.take() else {
            return;
        };
        let Some(pool) = self.pool(&entry.key).await else {
            conn.shut();
            return;
        };

        let conn = if !conn.healthy || self.is_draining() {
            conn.shut();
            None
        } else {
            self.vet(conn, true, self.config.probe_on_checkin).await
        };

        let rejected = {
            let mut p = pool.lock().await;
            match conn {
                Some(mut conn) if !self.is_draining() => {
                    conn.state = ConnState::Idle;
                    conn.last_used = Instant::now();
                    p.idle.push_back(conn);
                    tracing::debug!(
                        handle = handle,
                        key = %entry.key,
                        idle_count = p.idle.len(),
                        "returned connection to pool"
                    );
                    None
                }
                other => {
                    p.total = p.total.saturating_sub(1);
                    tracing::debug!(
                        handle = handle,
                        key = %entry.key,
                        "discarded connection on check-in"
                    );
                    other
                }
            }
        };
        if let Some(mut conn) = rejected {
            conn.shut();
        }
    }

    /// Close every handle still open for `owner`, as if the guest had
    /// called `close()` on each. Returns how many handles were torn down.
    pub async fn teardown_instance(&self, owner: InstanceId) -> usize {
        let entries = self.registry.lock().await.drain_owner(owner);
        let count = entries.len();
        if count > 0 {
            tracing::warn!(
                instance = owner,
                handles = count,
                "force-closing database handles left open by instance"
            );
        }
        for (handle, entry) in entries {
            self.check_in(handle, entry).await;
        }
        count
    }

    /// Reap idle connections that have exceeded the idle timeout.
    /// Returns the number of connections closed.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut reaped_total = 0;

        for (key, pool) in self.snapshot().await {
            let expired: Vec<PooledConnection> = {
                let mut p = pool.lock().await;
                let (keep, expired): (Vec<_>, Vec<_>) = p
                    .idle
                    .drain(..)
                    .partition(|conn| conn.last_used.elapsed() < idle_timeout);
                p.idle = VecDeque::from(keep);
                p.total = p.total.saturating_sub(expired.len());
                expired
            };
            if expired.is_empty() {
                continue;
            }
            reaped_total += expired.len();
            tracing::info!(
                host = %key.host,
                port = key.port,
                database = %key.database,
                reaped = expired.len(),
                "reaped idle connections"
            );
            for mut conn in expired {
                conn.shut();
            }
        }
        reaped_total
    }

    /// Probe every idle connection, dropping the dead ones.
    ///
    /// Connections are taken out one at a time and the pool lock is not
    /// held while probing. A checkout that finds the pool full meanwhile
    /// waits for the probe instead of failing. Returns the number removed.
    pub async fn health_check_idle(&self) -> usize {
        let mut removed_total = 0;

        for (key, pool) in self.snapshot().await {
            let rounds = pool.lock().await.idle.len();
            let mut removed = 0;

            for _ in 0..rounds {
                let candidate = {
                    let mut p = pool.lock().await;
                    let conn = p.idle.pop_front();
                    if conn.is_some() {
                        p.probing += 1;
                    }
                    conn
                };
                let Some(conn) = candidate else { break };

                let survivor = self.probe(conn).await;
                let rejected = {
                    let mut p = pool.lock().await;
                    p.probing -= 1;
                    match survivor {
                        Some(conn) if !self.is_draining() => {
                            p.idle.push_back(conn);
                            None
                        }
                        Some(conn) => {
                            p.total = p.total.saturating_sub(1);
                            Some(conn)
                        }
                        None => {
                            p.total = p.total.saturating_sub(1);
                            removed += 1;
                            None
                        }
                    }
                };
                self.probed.notify_waiters();
                if let Some(mut conn) = rejected {
                    conn.shut();
                }
            }

            if removed > 0 {
                tracing::info!(
                    host = %key.host,
                    port = key.port,
                    removed = removed,
                    "removed unhealthy idle connections"
                );
            }
            removed_total += removed;
        }
        removed_total
    }

    /// Get statistics for a specific pool key.
    pub async fn stats(&self, key: &PoolKey) -> PoolStats {
        let Some(pool) = self.pool(key).await else {
            return PoolStats {
                active: 0,
                idle: 0,
                total: 0,
                exhausted_count: 0,
            };
        };
        let p = pool.lock().await;
        PoolStats {
            active: p.total.saturating_sub(p.idle.len()),
            idle: p.idle.len(),
            total: p.total,
            exhausted_count: p.exhausted_count,
        }
    }

    /// Drain all connections: stop accepting new `connect()` calls, wait for
    /// in-flight connections to be released, then close all remaining connections.
    ///
    /// Returns the number of connections that were force-closed after the
    /// drain timeout expired.
    pub async fn drain(&self) -> usize {
        self.draining.store(true, Ordering::SeqCst);
        tracing::info!(
            drain_timeout = ?self.config.drain_timeout,
            "connection pool draining started"
        );

        let deadline = Instant::now() + self.config.drain_timeout;
        let poll_interval = Duration::from_millis(50);

        loop {
            let active_count = self.registry.lock().await.len();
            if active_count == 0 {
                tracing::info!("all in-flight connections drained gracefully");
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    remaining = active_count,
                    "drain timeout expired, force-closing remaining connections"
                );
                break;
            }
            tokio::time::sleep(poll_interval).await;
        }

        let remaining = self.registry.lock().await.drain_all();
        let force_closed = remaining.len();
        for (handle, entry) in remaining {
            tracing::debug!(handle = handle, "force-closing connection during drain");
            self.check_in(handle, entry).await;
        }

        for (key, pool) in self.snapshot().await {
            let idle: Vec<PooledConnection> = {
                let mut p = pool.lock().await;
                let idle: Vec<_> = p.idle.drain(..).collect();
                p.total = p.total.saturating_sub(idle.len());
                idle
            };
            if idle.is_empty() {
                continue;
            }
            tracing::debug!(
                host = %key.host,
                port = key.port,
                closed = idle.len(),
                "closed idle connections during drain"
            );
            for mut conn in idle {
                conn.shut();
            }
        }

        tracing::info!(force_closed = force_closed, "connection pool drain complete");
        force_closed
    }

    /// Log pool statistics for all pools at `tracing::info` level.
    pub async fn log_stats(&self) {
        for (key, pool) in self.snapshot().await {
            let p = pool.lock().await;
            tracing::info!(
                host = %key.host,
                port = key.port,
                database = %key.database,
                user = %key.user,
                protocol = %key.protocol,
                active = p.total.saturating_sub(p.idle.len()),
                idle = p.idle.len(),
                total = p.total,
                capacity = p.capacity,
                exhausted_count = p.exhausted_count,
                "pool statistics"
            );
        }
    }
}

/// Give back a slot reserved for a connection that never made it out.
async fn release_slot(pool: &Mutex<Pool>) {
    let mut p = pool.lock().await;
    p.total = p.total.saturating_sub(1);
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl std::fmt::Debug for ConnectionPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("config", &self.config)
            .field("draining", &self.is_draining())
            .finish_non_exhaustive()
    }
}
