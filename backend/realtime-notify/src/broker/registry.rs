/// Connection Registry
///
/// Maps open connections to their delivery sinks.
/// Supports:
/// - Multiple concurrent connections per user (multi-tab)
/// - Idempotent unregister (disconnect races are expected)
/// - Concurrent register/unregister/lookup
///
/// Entries are grouped per user inside a `DashMap`, so every operation on one
/// user is atomic under that user's shard lock and lookups never observe a
/// half-applied update.
use super::{ConnectionId, ConnectionLifecycle, Event, Sink, UserId};
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One registered connection. Owned by the registry until unregistered.
#[derive(Clone)]
pub struct ConnectionEntry {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub sink: Arc<dyn Sink>,
    /// Queue drained by the connection's writer task
    pub outbound: mpsc::Sender<Event>,
    pub lifecycle: Arc<ConnectionLifecycle>,
    pub created_at: DateTime<Utc>,
}

impl ConnectionEntry {
    pub fn new(
        connection_id: ConnectionId,
        sink: Arc<dyn Sink>,
        outbound: mpsc::Sender<Event>,
        lifecycle: Arc<ConnectionLifecycle>,
    ) -> Self {
        Self {
            connection_id,
            user_id: connection_id.user_id(),
            sink,
            outbound,
            lifecycle,
            created_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("connection_id", &self.connection_id)
            .field("state", &self.lifecycle.state())
            .field("pending", &(self.outbound.max_capacity() - self.outbound.capacity()))
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    /// user_id -> connections of that user, in registration order
    connections: DashMap<UserId, Vec<ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection.
    ///
    /// Fails with `DuplicateConnection` if the id is already present.
    pub fn register(&self, entry: ConnectionEntry) -> Result<()> {
        let mut entries = self.connections.entry(entry.user_id).or_default();

        if entries
            .iter()
            .any(|existing| existing.connection_id == entry.connection_id)
        {
            return Err(BrokerError::DuplicateConnection(entry.connection_id));
        }

        entries.push(entry);
        Ok(())
    }

    /// Remove a connection. Returns the entry if it was present.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<ConnectionEntry> {
        let user_id = connection_id.user_id();

        let removed = {
            let mut entries = self.connections.get_mut(&user_id)?;
            let position = entries
                .iter()
                .position(|entry| entry.connection_id == *connection_id)?;
            entries.remove(position)
        };

        // Guard above is dropped; safe to touch the same shard again
        self.connections
            .remove_if(&user_id, |_, entries| entries.is_empty());

        Some(removed)
    }

    /// Snapshot of the connections currently registered for a user
    pub fn connections_for(&self, user_id: &UserId) -> Vec<ConnectionEntry> {
        self.connections
            .get(user_id)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<ConnectionEntry> {
        self.connections
            .get(&connection_id.user_id())?
            .iter()
            .find(|entry| entry.connection_id == *connection_id)
            .cloned()
    }

    pub fn connection_count(&self, user_id: &UserId) -> usize {
        self.connections
            .get(user_id)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Total number of open connections across all users
    pub fn len(&self) -> usize {
        self.connections.iter().map(|entries| entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn user_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_ids(&self) -> Vec<UserId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn all_connection_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .flat_map(|entries| {
                entries
                    .iter()
                    .map(|entry| entry.connection_id)
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
