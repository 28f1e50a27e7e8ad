// conn_cache.rs - Reuse of established peer connections across promises.
//
// Connections are keyed by (server, port, flags) and carry a status:
//
//   Idle    -> open and free; `find_idle_mark_busy` may hand it out
//   Busy    -> exactly one caller is using it
//   Offline -> the last exchange failed; evicted on the next lookup
//
// A single mutex guards the entry table, so the Idle -> Busy transition is
// atomic with respect to concurrent lookups. The set of (server, port)
// pairs that failed to connect during this run has its own lock; the run
// driver clears it when a new run starts.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::client::Connect;
use crate::connection::{AgentConnection, ConnectionFlags};
use crate::error::NetError;

/// A cached connection. Identity is the allocation (`Arc::ptr_eq`).
pub type SharedConnection = Arc<Mutex<AgentConnection>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnCacheStatus {
    Idle,
    Busy,
    Offline,
}

struct CacheEntry {
    conn: SharedConnection,
    server: String,
    port: String,
    flags: ConnectionFlags,
    status: ConnCacheStatus,
}

impl CacheEntry {
    fn matches(&self, server: &str, port: &str, flags: &ConnectionFlags) -> bool {
        self.server == server && self.port == port && self.flags == *flags
    }
}

#[derive(Default)]
pub struct ConnCache {
    entries: Mutex<Vec<CacheEntry>>,
    offline_servers: Mutex<HashSet<(String, String)>>,
}

fn disconnect(conn: &SharedConnection) {
    match conn.lock() {
        Ok(mut c) => c.disconnect(),
        Err(poisoned) => poisoned.into_inner().disconnect(),
    }
}

impl ConnCache {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the table lock cannot leave an entry half
    // written: every mutation is a single field store or Vec operation.
    fn lock_entries(&self) -> MutexGuard<'_, Vec<CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_offline(&self) -> MutexGuard<'_, HashSet<(String, String)>> {
        self.offline_servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out an idle connection for this key, marking it busy.
    ///
    /// Offline entries for the same key are disconnected and dropped on the
    /// way. Busy entries are left alone.
    pub fn find_idle_mark_busy(
        &self,
        server: &str,
        port: &str,
        flags: ConnectionFlags,
    ) -> Option<SharedConnection> {
        let mut evicted = Vec::new();
        let found = {
            let mut entries = self.lock_entries();
            entries.retain(|e| {
                if e.matches(server, port, &flags) && e.status == ConnCacheStatus::Offline {
                    evicted.push(e.conn.clone());
                    false
                } else {
                    true
                }
            });
            entries
                .iter_mut()
                .find(|e| e.matches(server, port, &flags) && e.status == ConnCacheStatus::Idle)
                .map(|e| {
                    e.status = ConnCacheStatus::Busy;
                    e.conn.clone()
                })
        };

        for conn in &evicted {
            tracing::debug!(server, port, "evicting offline connection");
            disconnect(conn);
        }
        match &found {
            Some(_) => tracing::debug!(server, port, "reusing cached connection"),
            None => tracing::debug!(server, port, "no idle cached connection"),
        }
        found
    }

    /// Store a newly opened connection.
    pub fn add(&self, conn: AgentConnection, status: ConnCacheStatus) -> SharedConnection {
        let entry = CacheEntry {
            server: conn.server().to_string(),
            port: conn.port().to_string(),
            flags: conn.flags(),
            conn: Arc::new(Mutex::new(conn)),
            status,
        };
        let shared = entry.conn.clone();
        self.lock_entries().push(entry);
        shared
    }

    fn set_status(&self, conn: &SharedConnection, status: ConnCacheStatus) -> Option<ConnCacheStatus> {
        let mut entries = self.lock_entries();
        let entry = entries.iter_mut().find(|e| Arc::ptr_eq(&e.conn, conn))?;
        let previous = entry.status;
        entry.status = status;
        Some(previous)
    }

    /// Return a busy connection to the pool.
    ///
    /// # Panics
    ///
    /// Panics if `conn` is not in the cache or is not busy: some caller is
    /// releasing a connection it never acquired.
    pub fn mark_not_busy(&self, conn: &SharedConnection) {
        let mut entries = self.lock_entries();
        let entry = entries
            .iter_mut()
            .find(|e| Arc::ptr_eq(&e.conn, conn))
            .unwrap_or_else(|| panic!("mark_not_busy: connection is not cached"));
        assert!(
            entry.status == ConnCacheStatus::Busy,
            "mark_not_busy: connection status is {:?}, not Busy",
            entry.status
        );
        entry.status = ConnCacheStatus::Idle;
    }

    /// Flag a connection as unusable; it is evicted on the next lookup.
    pub fn mark_offline(&self, conn: &SharedConnection) {
        if self.set_status(conn, ConnCacheStatus::Offline).is_none() {
            tracing::warn!("mark_offline: connection is not cached");
        }
    }

    pub fn is_busy(&self, conn: &SharedConnection) -> bool {
        self.status(conn) == Some(ConnCacheStatus::Busy)
    }

    pub fn status(&self, conn: &SharedConnection) -> Option<ConnCacheStatus> {
        self.lock_entries()
            .iter()
            .find(|e| Arc::ptr_eq(&e.conn, conn))
            .map(|e| e.status)
    }

    /// Drop a connection from the cache without disconnecting it.
    pub fn remove(&self, conn: &SharedConnection) -> bool {
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|e| !Arc::ptr_eq(&e.conn, conn));
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Disconnect and drop every cached connection.
    pub fn destroy(&self) {
        let drained: Vec<CacheEntry> = self.lock_entries().drain(..).collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "closing cached connections");
        }
        for entry in &drained {
            if entry.status == ConnCacheStatus::Busy {
                tracing::warn!(server = %entry.server, "closing a connection that is still busy");
            }
            disconnect(&entry.conn);
        }
    }

    // -- server offline list -------------------------------------------------

    pub fn mark_server_offline(&self, server: &str, port: &str) {
        self.lock_offline()
            .insert((server.to_string(), port.to_string()));
    }

    pub fn server_is_offline(&self, server: &str, port: &str) -> bool {
        self.lock_offline()
            .contains(&(server.to_string(), port.to_string()))
    }

    /// Forget which servers failed. Called when a new run starts.
    pub fn clear_offline_servers(&self) {
        let mut offline = self.lock_offline();
        if !offline.is_empty() {
            tracing::debug!(count = offline.len(), "clearing offline servers");
        }
        offline.clear();
    }

    /// Reuse an idle connection for this key or open a new one, and lease it.
    ///
    /// A server whose connection attempt already failed in this run is not
    /// retried. New connections enter the cache as busy.
    pub fn acquire(
        self: &Arc<Self>,
        server: &str,
        port: &str,
        flags: ConnectionFlags,
        connector: &dyn Connect,
    ) -> Result<ConnectionLease, NetError> {
        if let Some(conn) = self.find_idle_mark_busy(server, port, flags) {
            return Ok(ConnectionLease::new(self.clone(), conn));
        }
        if self.server_is_offline(server, port) {
            return Err(NetError::ServerOffline {
                server: server.to_string(),
            });
        }

        match connector.connect(server, port, flags) {
            Ok(conn) => {
                let shared = self.add(conn, ConnCacheStatus::Busy);
                Ok(ConnectionLease::new(self.clone(), shared))
            }
            Err(e) => {
                tracing::warn!(server, port, error = %e, "connection failed, marking server offline");
                self.mark_server_offline(server, port);
                Err(e)
            }
        }
    }
}

impl Drop for ConnCache {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Exclusive use of one busy cached connection.
///
/// Dropping the lease gives the connection back as idle, or marks it
/// offline if a transport error went through [`ConnectionLease::with`].
pub struct ConnectionLease {
    cache: Arc<ConnCache>,
    conn: SharedConnection,
    failed: bool,
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl ConnectionLease {
    fn new(cache: Arc<ConnCache>, conn: SharedConnection) -> Self {
        Self {
            cache,
            conn,
            failed: false,
        }
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }

    /// Run `f` on the connection. Transport errors poison the lease.
    pub fn with<T, F>(&mut self, f: F) -> Result<T, NetError>
    where
        F: FnOnce(&mut AgentConnection) -> Result<T, NetError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| NetError::Lock(e.to_string()))?;
        let result = f(&mut conn);
        if let Err(e) = &result {
            if e.is_transport() {
                tracing::warn!(server = %conn.server(), error = %e, "transport error, connection goes offline");
                self.failed = true;
            }
        }
        result
    }

    /// Force the connection offline when the lease ends.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let status = if self.failed {
            ConnCacheStatus::Offline
        } else {
            ConnCacheStatus::Idle
        };
        match self.cache.set_status(&self.conn, status) {
            Some(ConnCacheStatus::Busy) => {}
            Some(other) => tracing::warn!(?other, "leased connection was not busy"),
            None => tracing::debug!("leased connection left the cache before release"),
        }
    }
}
