//! Connection registry
//!
//! Single source of truth for who is connected right now. Owns the identity
//! counter and the id -> connection map; every read and write goes through
//! the lock, and broadcasts iterate over a snapshot taken under a short read
//! lock rather than over the live map.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use super::{ClientConnection, ConnectionId, ConnectionState};

/// Registry of open connections keyed by identity
pub struct Registry {
    /// Next identity to hand out; starts at 1 and never goes back
    next_id: AtomicU64,
    connections: RwLock<BTreeMap<ConnectionId, Arc<ClientConnection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a connection and mark it open
    ///
    /// Returns the freshly assigned identity. Identities are never reused,
    /// even after the connection holding one has gone away.
    pub async fn register(&self, connection: Arc<ClientConnection>) -> ConnectionId {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut connections = self.connections.write().await;
        connection.set_state(ConnectionState::Open);
        let previous = connections.insert(id, connection);
        assert!(
            previous.is_none(),
            "registry inconsistency: connection id {id} assigned twice"
        );

        debug!("Registered Client {} ({} connected)", id, connections.len());
        id
    }

    /// Remove a connection if it is still registered
    ///
    /// Idempotent: unknown or already removed ids are ignored. Returns
    /// whether an entry was actually removed.
    pub async fn deregister(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut connections = self.connections.write().await;
            connections.remove(&id)
        };

        match removed {
            Some(connection) => {
                connection.set_state(ConnectionState::Closed);
                debug!("Deregistered Client {}", id);
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of the membership, ordered by identity
    ///
    /// The lock is released before this returns, so callers may take as long
    /// as they like delivering to the entries.
    pub async fn snapshot(&self) -> Vec<(ConnectionId, Arc<ClientConnection>)> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .map(|(id, conn)| (*id, Arc::clone(conn)))
            .collect()
    }

    /// Look up a registered connection
    pub async fn get(&self, id: ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Number of registered connections
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
