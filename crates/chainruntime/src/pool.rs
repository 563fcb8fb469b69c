//! Connection pool for tool-server clients.
//!
//! Connections are keyed by server id and borrowed through a
//! [`ConnectionLease`]. A global semaphore enforces the connection ceiling;
//! each open connection holds one permit for its whole lifetime. A
//! background worker closes connections that stayed idle past the
//! configured timeout.

use crate::config::PoolConfig;
use crate::registry::ServerRegistry;
use chaincore::{ConnectionError, ServerConfig, ToolClient, ToolConnector};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

struct PooledConnection {
    id: u64,
    client: Option<Arc<dyn ToolClient>>,
    state: ConnectionState,
    in_use: bool,
    pre_warmed: bool,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    _slot: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn is_idle(&self) -> bool {
        !self.in_use && self.state == ConnectionState::Connected
    }

    fn is_healthy(&self) -> bool {
        self.client.as_ref().map_or(false, |c| c.is_healthy())
    }
}

/// Point-in-time view of one pooled connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub server_id: String,
    pub state: ConnectionState,
    pub in_use: bool,
    pub pre_warmed: bool,
    pub use_count: u64,
    pub age_ms: u64,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_gets: u64,
    pub reused_gets: u64,
    pub reuse_rate: f64,
    pub connections_created: u64,
    pub connections_closed: u64,
    pub failed_connects: u64,
    pub idle_evictions: u64,
    pub pre_warmed_connections: u64,
    pub open_connections: usize,
    pub idle_connections: usize,
}

#[derive(Default)]
struct PoolCounters {
    total_gets: AtomicU64,
    reused_gets: AtomicU64,
    created: AtomicU64,
    closed: AtomicU64,
    failed_connects: AtomicU64,
    idle_evictions: AtomicU64,
    pre_warmed: AtomicU64,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn ToolConnector>,
    connections: Mutex<HashMap<String, Vec<PooledConnection>>>,
    /// One permit per open or opening connection
    slots: Arc<Semaphore>,
    /// Woken whenever a connection returns to the idle set or is closed
    released: Notify,
    usage: DashMap<String, u64>,
    failed_servers: Mutex<HashSet<String>>,
    counters: PoolCounters,
    next_id: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl PoolInner {
    /// Take the most recently used healthy idle connection for `server_id`.
    /// Unhealthy idle connections found on the way are removed and returned
    /// for closing.
    fn checkout_idle(
        &self,
        server_id: &str,
    ) -> (Option<(u64, Arc<dyn ToolClient>)>, Vec<PooledConnection>) {
        let mut connections = self.connections.lock();
        let Some(list) = connections.get_mut(server_id) else {
            return (None, Vec::new());
        };

        let mut stale = Vec::new();
        let mut i = 0;
        while i < list.len() {
            if list[i].is_idle() && !list[i].is_healthy() {
                let mut conn = list.swap_remove(i);
                conn.state = ConnectionState::Failed;
                stale.push(conn);
            } else {
                i += 1;
            }
        }

        let checked_out = list
            .iter_mut()
            .filter(|c| c.is_idle())
            .max_by_key(|c| c.last_used)
            .and_then(|conn| {
                conn.in_use = true;
                conn.use_count += 1;
                conn.last_used = Instant::now();
                conn.client.clone().map(|client| (conn.id, client))
            });

        if list.is_empty() {
            connections.remove(server_id);
        }
        (checked_out, stale)
    }

    /// Remove the least recently used idle connection across all servers.
    fn take_lru_idle(&self) -> Option<(String, PooledConnection)> {
        let mut connections = self.connections.lock();
        let (server_id, id) = connections
            .iter()
            .flat_map(|(server_id, list)| {
                list.iter()
                    .filter(|c| c.is_idle())
                    .map(move |c| (server_id, c.id, c.last_used))
            })
            .min_by_key(|(_, _, last_used)| *last_used)
            .map(|(server_id, id, _)| (server_id.clone(), id))?;
        let conn = Self::detach(&mut connections, &server_id, id)?;
        Some((server_id, conn))
    }

    fn detach(
        connections: &mut HashMap<String, Vec<PooledConnection>>,
        server_id: &str,
        id: u64,
    ) -> Option<PooledConnection> {
        let list = connections.get_mut(server_id)?;
        let pos = list.iter().position(|c| c.id == id)?;
        let conn = list.swap_remove(pos);
        if list.is_empty() {
            connections.remove(server_id);
        }
        Some(conn)
    }

    /// Drop a connection's slot and hand back its client for closing.
    fn retire(&self, conn: PooledConnection) -> Option<Arc<dyn ToolClient>> {
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        let client = conn.client.clone();
        drop(conn);
        self.released.notify_waiters();
        client
    }

    async fn retire_and_close(&self, server_id: &str, conn: PooledConnection) {
        let id = conn.id;
        if let Some(client) = self.retire(conn) {
            close_client(server_id, id, client).await;
        }
    }

    fn retire_in_background(&self, server_id: &str, conn: PooledConnection) {
        let id = conn.id;
        let Some(client) = self.retire(conn) else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let server_id = server_id.to_string();
                handle.spawn(async move { close_client(&server_id, id, client).await });
            }
            Err(_) => debug!("No runtime to close connection {} to {}", id, server_id),
        }
    }

    /// Return a borrowed connection. Broken or unhealthy connections are
    /// closed instead of being made idle.
    fn check_in(&self, server_id: &str, id: u64, broken: bool) {
        let retired = {
            let mut connections = self.connections.lock();
            let Some(list) = connections.get_mut(server_id) else { return };
            let Some(conn) = list.iter_mut().find(|c| c.id == id) else { return };
            let keep = !broken && !self.closed.load(Ordering::Acquire) && conn.is_healthy();
            if keep {
                conn.in_use = false;
                conn.last_used = Instant::now();
                None
            } else {
                conn.state = ConnectionState::Failed;
                Self::detach(&mut connections, server_id, id)
            }
        };

        match retired {
            None => {
                debug!("Connection {} to {} returned to the pool", id, server_id);
                self.released.notify_waiters();
            }
            Some(conn) => {
                debug!("Closing broken connection {} to {}", id, server_id);
                self.retire_in_background(server_id, conn);
            }
        }
    }

    /// Wait for a free connection slot, evicting idle connections of other
    /// servers when the pool is at its ceiling.
    async fn acquire_slot(
        &self,
        server_id: &str,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, ConnectionError> {
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout();
        loop {
            let released = self.released.notified();

            match self.slots.clone().try_acquire_owned() {
                Ok(permit) => return Ok(permit),
                Err(tokio::sync::TryAcquireError::Closed) => return Err(ConnectionError::PoolClosed),
                Err(tokio::sync::TryAcquireError::NoPermits) => {}
            }

            if let Some((victim_server, victim)) = self.take_lru_idle() {
                debug!(
                    "Pool at capacity, evicting idle connection {} to {}",
                    victim.id, victim_server
                );
                self.retire_and_close(&victim_server, victim).await;
                continue;
            }

            debug!("Pool at capacity, waiting for a slot for {}", server_id);
            let acquired = tokio::select! {
                _ = cancel.cancelled() => Some(Err(ConnectionError::Cancelled)),
                _ = self.shutdown.cancelled() => Some(Err(ConnectionError::PoolClosed)),
                _ = tokio::time::sleep_until(deadline) => {
                    Some(Err(ConnectionError::AcquireTimeout(server_id.to_string())))
                }
                permit = self.slots.clone().acquire_owned() => {
                    Some(permit.map_err(|_| ConnectionError::PoolClosed))
                }
                _ = released => None,
            };
            if let Some(result) = acquired {
                return result;
            }
        }
    }

    /// Open and register a new connection. The entry is visible as
    /// `Connecting` while the connector runs.
    async fn open_connection(
        &self,
        server: &ServerConfig,
        cancel: &CancellationToken,
        in_use: bool,
        pre_warmed: bool,
    ) -> Result<(u64, Arc<dyn ToolClient>), ConnectionError> {
        let slot = self.acquire_slot(&server.id, cancel).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Instant::now();
        self.connections
            .lock()
            .entry(server.id.clone())
            .or_default()
            .push(PooledConnection {
                id,
                client: None,
                state: ConnectionState::Connecting,
                in_use,
                pre_warmed,
                created_at: now,
                last_used: now,
                use_count: u64::from(in_use),
                _slot: slot,
            });

        debug!("Connecting to tool server {}", server.id);
        let connect_timeout = self.config.connect_timeout();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
            connected = tokio::time::timeout(connect_timeout, self.connector.connect(server)) => {
                match connected {
                    Ok(result) => result,
                    Err(_) => Err(ConnectionError::ConnectFailed {
                        server_id: server.id.clone(),
                        message: format!("connect timed out after {}ms", connect_timeout.as_millis()),
                    }),
                }
            }
        };

        match result {
            Ok(client) => {
                let registered = {
                    let mut connections = self.connections.lock();
                    match connections
                        .get_mut(&server.id)
                        .and_then(|list| list.iter_mut().find(|c| c.id == id))
                    {
                        Some(conn) => {
                            conn.client = Some(client.clone());
                            conn.state = ConnectionState::Connected;
                            true
                        }
                        None => false,
                    }
                };
                if !registered {
                    // pool was closed while connecting
                    close_client(&server.id, id, client).await;
                    return Err(ConnectionError::PoolClosed);
                }

                self.counters.created.fetch_add(1, Ordering::Relaxed);
                self.failed_servers.lock().remove(&server.id);
                info!("Opened connection {} to tool server {}", id, server.id);
                if !in_use {
                    self.released.notify_waiters();
                }
                Ok((id, client))
            }
            Err(e) => {
                let placeholder = Self::detach(&mut self.connections.lock(), &server.id, id);
                drop(placeholder);
                self.released.notify_waiters();
                self.counters.failed_connects.fetch_add(1, Ordering::Relaxed);
                if e != ConnectionError::Cancelled {
                    self.failed_servers.lock().insert(server.id.clone());
                }
                warn!("Failed to connect to tool server {}: {}", server.id, e);
                Err(e)
            }
        }
    }

    async fn reap_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let expired: Vec<(String, PooledConnection)> = {
            let mut connections = self.connections.lock();
            let mut expired = Vec::new();
            for (server_id, list) in connections.iter_mut() {
                let mut i = 0;
                while i < list.len() {
                    if list[i].is_idle() && list[i].last_used.elapsed() >= idle_timeout {
                        expired.push((server_id.clone(), list.swap_remove(i)));
                    } else {
                        i += 1;
                    }
                }
            }
            connections.retain(|_, list| !list.is_empty());
            expired
        };

        let count = expired.len();
        self.counters
            .idle_evictions
            .fetch_add(count as u64, Ordering::Relaxed);
        for (server_id, conn) in expired {
            debug!("Closing idle connection {} to {}", conn.id, server_id);
            self.retire_and_close(&server_id, conn).await;
        }
        if count > 0 {
            info!("Closed {} idle connections", count);
        }
        count
    }
}

async fn close_client(server_id: &str, id: u64, client: Arc<dyn ToolClient>) {
    if let Err(e) = client.close().await {
        warn!("Error closing connection {} to {}: {}", id, server_id, e);
    }
}

/// RAII handle to a pooled connection.
///
/// Dropping the lease returns the connection to the pool. Call
/// [`ConnectionLease::mark_broken`] after a transport failure so the
/// connection is closed instead of reused.
pub struct ConnectionLease {
    pool: Arc<PoolInner>,
    server_id: String,
    connection_id: u64,
    client: Arc<dyn ToolClient>,
    reused: bool,
    broken: bool,
}

impl ConnectionLease {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn client(&self) -> &Arc<dyn ToolClient> {
        &self.client
    }

    /// True when the connection came from the idle set
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("server_id", &self.server_id)
            .field("connection_id", &self.connection_id)
            .field("reused", &self.reused)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.pool
            .check_in(&self.server_id, self.connection_id, self.broken);
    }
}

/// Pool of tool-server connections shared by all executions of an engine
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool. The idle reaper is started when called inside a tokio
    /// runtime.
    pub fn new(config: PoolConfig, connector: Arc<dyn ToolConnector>) -> Self {
        let inner = Arc::new(PoolInner {
            slots: Arc::new(Semaphore::new(config.max_connections)),
            config,
            connector,
            connections: Mutex::new(HashMap::new()),
            released: Notify::new(),
            usage: DashMap::new(),
            failed_servers: Mutex::new(HashSet::new()),
            counters: PoolCounters::default(),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(run_reaper(Arc::downgrade(&inner), inner.shutdown.clone()));
        } else {
            debug!("Connection pool created outside a runtime, idle reaper disabled");
        }

        Self { inner }
    }

    /// Borrow a connection to `server`, reusing an idle one when possible.
    pub async fn get(
        &self,
        server: &ServerConfig,
        cancel: &CancellationToken,
    ) -> Result<ConnectionLease, ConnectionError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::PoolClosed);
        }
        if cancel.is_cancelled() {
            return Err(ConnectionError::Cancelled);
        }

        inner.counters.total_gets.fetch_add(1, Ordering::Relaxed);
        *inner.usage.entry(server.id.clone()).or_insert(0) += 1;

        let (reusable, stale) = inner.checkout_idle(&server.id);
        for conn in stale {
            debug!("Dropping unhealthy idle connection {} to {}", conn.id, server.id);
            inner.retire_and_close(&server.id, conn).await;
        }

        if let Some((connection_id, client)) = reusable {
            inner.counters.reused_gets.fetch_add(1, Ordering::Relaxed);
            debug!("Reusing connection {} to {}", connection_id, server.id);
            return Ok(ConnectionLease {
                pool: inner.clone(),
                server_id: server.id.clone(),
                connection_id,
                client,
                reused: true,
                broken: false,
            });
        }

        let (connection_id, client) = inner.open_connection(server, cancel, true, false).await?;
        Ok(ConnectionLease {
            pool: inner.clone(),
            server_id: server.id.clone(),
            connection_id,
            client,
            reused: false,
            broken: false,
        })
    }

    /// Return a borrowed connection. Equivalent to dropping the lease.
    pub fn release(&self, lease: ConnectionLease) {
        drop(lease);
    }

    /// Open one idle connection per listed server ahead of first use.
    ///
    /// Best-effort: unknown servers and connect failures are logged and
    /// skipped. Returns the number of servers warmed by this call.
    pub async fn pre_warm(
        &self,
        registry: &ServerRegistry,
        server_ids: &[String],
        cancel: &CancellationToken,
    ) -> usize {
        let mut seen = HashSet::new();
        let warmups = server_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter(|id| !self.is_pre_warmed(id))
            .map(|id| async move {
                let server = match registry.resolve(id) {
                    Ok(server) => server,
                    Err(e) => {
                        warn!("Skipping pre-warm of {}: {}", id, e);
                        return false;
                    }
                };
                match self.inner.open_connection(server, cancel, false, true).await {
                    Ok(_) => {
                        self.inner.counters.pre_warmed.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(e) => {
                        warn!("Pre-warm of {} failed: {}", id, e);
                        false
                    }
                }
            })
            .collect::<Vec<_>>();

        let warmed = join_all(warmups).await.into_iter().filter(|ok| *ok).count();
        if warmed > 0 {
            info!("Pre-warmed {} tool servers", warmed);
        }
        warmed
    }

    /// Whether an open pre-warmed connection exists for `server_id`.
    pub fn is_pre_warmed(&self, server_id: &str) -> bool {
        self.inner
            .connections
            .lock()
            .get(server_id)
            .map_or(false, |list| {
                list.iter()
                    .any(|c| c.pre_warmed && c.state == ConnectionState::Connected)
            })
    }

    /// Aggregate state of the connections to `server_id`.
    pub fn server_state(&self, server_id: &str) -> ConnectionState {
        let states: Vec<ConnectionState> = self
            .inner
            .connections
            .lock()
            .get(server_id)
            .map(|list| list.iter().map(|c| c.state).collect())
            .unwrap_or_default();

        if states.contains(&ConnectionState::Connected) {
            ConnectionState::Connected
        } else if states.contains(&ConnectionState::Connecting) {
            ConnectionState::Connecting
        } else if self.inner.failed_servers.lock().contains(server_id) {
            ConnectionState::Failed
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Servers with the highest usage count, most used first.
    pub fn frequent_servers(&self, limit: usize) -> Vec<(String, u64)> {
        let mut usage: Vec<(String, u64)> = self
            .inner
            .usage
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        usage.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        usage.truncate(limit);
        usage
    }

    /// Close idle connections past the idle timeout. Runs periodically in
    /// the background worker.
    pub async fn reap_idle(&self) -> usize {
        self.inner.reap_idle().await
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let connections = self.inner.connections.lock();
        let mut infos: Vec<ConnectionInfo> = connections
            .iter()
            .flat_map(|(server_id, list)| {
                list.iter().map(move |c| ConnectionInfo {
                    id: c.id,
                    server_id: server_id.clone(),
                    state: c.state,
                    in_use: c.in_use,
                    pre_warmed: c.pre_warmed,
                    use_count: c.use_count,
                    age_ms: c.created_at.elapsed().as_millis() as u64,
                    idle_ms: if c.in_use {
                        0
                    } else {
                        c.last_used.elapsed().as_millis() as u64
                    },
                })
            })
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    /// Number of open (or opening) connections
    pub fn size(&self) -> usize {
        self.inner.connections.lock().values().map(Vec::len).sum()
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.inner.counters;
        let (open, idle) = {
            let connections = self.inner.connections.lock();
            let open = connections.values().map(Vec::len).sum();
            let idle = connections
                .values()
                .flat_map(|list| list.iter())
                .filter(|c| c.is_idle())
                .count();
            (open, idle)
        };
        let total_gets = counters.total_gets.load(Ordering::Relaxed);
        let reused_gets = counters.reused_gets.load(Ordering::Relaxed);
        PoolStats {
            total_gets,
            reused_gets,
            reuse_rate: if total_gets == 0 {
                0.0
            } else {
                reused_gets as f64 / total_gets as f64
            },
            connections_created: counters.created.load(Ordering::Relaxed),
            connections_closed: counters.closed.load(Ordering::Relaxed),
            failed_connects: counters.failed_connects.load(Ordering::Relaxed),
            idle_evictions: counters.idle_evictions.load(Ordering::Relaxed),
            pre_warmed_connections: counters.pre_warmed.load(Ordering::Relaxed),
            open_connections: open,
            idle_connections: idle,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop the reaper and close every connection. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.shutdown.cancel();
        inner.slots.close();

        let drained: Vec<(String, PooledConnection)> = inner
            .connections
            .lock()
            .drain()
            .flat_map(|(server_id, list)| list.into_iter().map(move |c| (server_id.clone(), c)))
            .collect();
        for (server_id, conn) in drained {
            inner.retire_and_close(&server_id, conn).await;
        }
        info!("Connection pool closed");
    }
}

async fn run_reaper(pool: Weak<PoolInner>, shutdown: CancellationToken) {
    let interval = match pool.upgrade() {
        Some(inner) => inner.config.cleanup_interval(),
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = pool.upgrade() else { break };
                inner.reap_idle().await;
            }
        }
    }
    debug!("Connection pool reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chaincore::{NodeError, ToolInfo, Value};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct MockClient {
        healthy: AtomicBool,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolClient for MockClient {
        async fn call_tool(&self, name: &str, _arguments: serde_json::Value) -> Result<Value, NodeError> {
            Ok(Value::from(name))
        }

        async fn list_tools(&self) -> Result<Vec<ToolInfo>, ConnectionError> {
            Ok(Vec::new())
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<(), ConnectionError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockConnector {
        connects: AtomicUsize,
        closed: Arc<AtomicUsize>,
        failing: Mutex<HashSet<String>>,
        clients: Mutex<Vec<Arc<MockClient>>>,
    }

    #[async_trait]
    impl ToolConnector for MockConnector {
        async fn connect(&self, server: &ServerConfig) -> Result<Arc<dyn ToolClient>, ConnectionError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().contains(&server.id) {
                return Err(ConnectionError::ConnectFailed {
                    server_id: server.id.clone(),
                    message: "refused".to_string(),
                });
            }
            let client = Arc::new(MockClient {
                healthy: AtomicBool::new(true),
                closed: self.closed.clone(),
            });
            self.clients.lock().push(client.clone());
            Ok(client)
        }
    }

    fn pool_with(config: PoolConfig) -> (ConnectionPool, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::default());
        (ConnectionPool::new(config, connector.clone()), connector)
    }

    fn small_pool(max_connections: usize) -> (ConnectionPool, Arc<MockConnector>) {
        pool_with(PoolConfig {
            max_connections,
            acquire_timeout_ms: 100,
            ..PoolConfig::default()
        })
    }

    #[tokio::test]
    async fn test_release_then_get_reuses_connection() {
        let (pool, connector) = small_pool(4);
        let server = ServerConfig::local("math");
        let cancel = CancellationToken::new();

        let lease = pool.get(&server, &cancel).await.unwrap();
        assert!(!lease.is_reused());
        pool.release(lease);

        let lease = pool.get(&server, &cancel).await.unwrap();
        assert!(lease.is_reused());
        drop(lease);

        let stats = pool.stats();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(stats.total_gets, 2);
        assert_eq!(stats.reused_gets, 1);
        assert!(stats.reuse_rate > 0.0);
        assert_eq!(stats.idle_connections, 1);
    }

    #[tokio::test]
    async fn test_failed_connect_never_becomes_idle() {
        let (pool, connector) = small_pool(4);
        connector.failing.lock().insert("down".to_string());
        let server = ServerConfig::local("down");

        let result = pool.get(&server, &CancellationToken::new()).await;
        assert!(matches!(result, Err(ConnectionError::ConnectFailed { .. })));
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.stats().failed_connects, 1);
        assert_eq!(pool.server_state("down"), ConnectionState::Failed);
        assert_eq!(pool.server_state("other"), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_ceiling_evicts_idle_connection_of_other_server() {
        let (pool, connector) = small_pool(1);
        let cancel = CancellationToken::new();

        drop(pool.get(&ServerConfig::local("a"), &cancel).await.unwrap());
        let lease = pool.get(&ServerConfig::local("b"), &cancel).await.unwrap();

        assert_eq!(pool.size(), 1);
        assert_eq!(lease.server_id(), "b");
        assert_eq!(pool.stats().connections_closed, 1);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ceiling_waits_then_times_out() {
        let (pool, _connector) = small_pool(1);
        let cancel = CancellationToken::new();
        let _held = pool.get(&ServerConfig::local("a"), &cancel).await.unwrap();

        let result = pool.get(&ServerConfig::local("b"), &cancel).await;
        assert_eq!(result.err(), Some(ConnectionError::AcquireTimeout("b".to_string())));
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_waiting_get_proceeds_after_release() {
        let (pool, _connector) = pool_with(PoolConfig {
            max_connections: 1,
            acquire_timeout_ms: 5_000,
            ..PoolConfig::default()
        });
        let cancel = CancellationToken::new();
        let held = pool.get(&ServerConfig::local("a"), &cancel).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.get(&ServerConfig::local("b"), &cancel).await.map(|l| l.server_id().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), "b");
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting() {
        let (pool, _connector) = pool_with(PoolConfig {
            max_connections: 1,
            acquire_timeout_ms: 5_000,
            ..PoolConfig::default()
        });
        let cancel = CancellationToken::new();
        let _held = pool.get(&ServerConfig::local("a"), &cancel).await.unwrap();

        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trip.cancel();
        });
        let result = pool.get(&ServerConfig::local("b"), &cancel).await;
        assert_eq!(result.err(), Some(ConnectionError::Cancelled));
    }

    #[tokio::test]
    async fn test_pre_warm_marks_listed_servers_only() {
        let (pool, connector) = small_pool(8);
        let mut registry = ServerRegistry::new();
        for id in ["a", "b", "c"] {
            registry.register(ServerConfig::local(id));
        }
        let cancel = CancellationToken::new();

        let warmed = pool
            .pre_warm(&registry, &["a".to_string(), "b".to_string(), "missing".to_string()], &cancel)
            .await;

        assert_eq!(warmed, 2);
        assert!(pool.is_pre_warmed("a"));
        assert!(pool.is_pre_warmed("b"));
        assert!(!pool.is_pre_warmed("c"));
        assert_eq!(pool.stats().pre_warmed_connections, 2);

        let lease = pool.get(registry.get("a").unwrap(), &cancel).await.unwrap();
        assert!(lease.is_reused());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reaper_closes_idle_connections() {
        let (pool, _connector) = pool_with(PoolConfig {
            idle_timeout_ms: 10,
            ..PoolConfig::default()
        });
        let cancel = CancellationToken::new();
        let registry = {
            let mut r = ServerRegistry::new();
            r.register(ServerConfig::local("a"));
            r
        };
        pool.pre_warm(&registry, &["a".to_string()], &cancel).await;
        let busy = pool.get(&ServerConfig::local("b"), &cancel).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pool.reap_idle().await, 1);
        assert!(!pool.is_pre_warmed("a"));
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.stats().idle_evictions, 1);
        drop(busy);
    }

    #[tokio::test]
    async fn test_broken_connection_is_closed_on_release() {
        let (pool, connector) = small_pool(4);
        let cancel = CancellationToken::new();
        let server = ServerConfig::local("a");

        let mut lease = pool.get(&server, &cancel).await.unwrap();
        lease.mark_broken();
        drop(lease);
        assert_eq!(pool.size(), 0);

        let lease = pool.get(&server, &cancel).await.unwrap();
        connector.clients.lock()[1].healthy.store(false, Ordering::SeqCst);
        drop(lease);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.stats().connections_closed, 2);
    }

    #[tokio::test]
    async fn test_frequent_servers_and_close() {
        let (pool, _connector) = small_pool(4);
        let cancel = CancellationToken::new();
        for id in ["a", "b", "b", "c", "b", "c"] {
            drop(pool.get(&ServerConfig::local(id), &cancel).await.unwrap());
        }
        assert_eq!(
            pool.frequent_servers(2),
            vec![("b".to_string(), 3), ("c".to_string(), 2)]
        );

        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(pool.size(), 0);
        assert_eq!(
            pool.get(&ServerConfig::local("a"), &cancel).await.err(),
            Some(ConnectionError::PoolClosed)
        );
    }
}
