//! Connection registry: who is online and how to reach them.
//!
//! The registry is the single authoritative map from user identity to live
//! connection. It is touched by nearly every operation, so it stays a pure
//! map with short-held per-entry locks; presence broadcasts are side
//! effects owned by callers.

use crate::ids::now_millis;
use dashmap::DashMap;
use tether_protocol::ServerEvent;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A user identity.
pub type UserId = String;

/// A connection identity (one per transport connection, not per user).
pub type ConnectionId = String;

/// Handle to a live connection's outbound queue.
///
/// Sending is fire-and-forget: events are pushed into the connection's
/// outbound channel and the connection task drains them to the transport.
/// A handle can go stale at any point; callers must re-`lookup` instead of
/// holding one across time.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    outbound: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    /// Create a handle from a connection id and its outbound queue.
    #[must_use]
    pub fn new(
        connection_id: impl Into<ConnectionId>,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            outbound,
        }
    }

    /// The connection id this handle refers to.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue an event for delivery.
    ///
    /// Returns `false` if the connection has already gone away; the event
    /// is dropped in that case.
    pub fn send(&self, event: ServerEvent) -> bool {
        let delivered = self.outbound.send(event).is_ok();
        if !delivered {
            trace!(connection = %self.connection_id, "Dropped event for closed connection");
        }
        delivered
    }
}

/// One online user.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    /// Handle to the user's live connection.
    pub handle: ConnectionHandle,
    /// When the user came online, milliseconds since the Unix epoch.
    pub online_since: u64,
}

/// Registry of currently online users.
///
/// Invariant: at most one entry per user id; a new connection for an
/// already-online user replaces the prior entry (last-connect-wins).
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<UserId, ConnectionEntry>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of online users.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.entries.len()
    }

    /// Register a user as online, replacing any prior entry.
    ///
    /// Returns the displaced entry if the user was already online. The
    /// presence broadcast accompanying this mutation is the caller's
    /// responsibility.
    pub fn set_online(
        &self,
        user_id: impl Into<UserId>,
        handle: ConnectionHandle,
    ) -> Option<ConnectionEntry> {
        let user_id = user_id.into();
        let entry = ConnectionEntry {
            handle,
            online_since: now_millis(),
        };
        let displaced = self.entries.insert(user_id.clone(), entry);
        debug!(
            user = %user_id,
            replaced = displaced.is_some(),
            online = self.entries.len(),
            "User online"
        );
        displaced
    }

    /// Look up a user's live connection.
    ///
    /// Absence means "not currently reachable" and is not an error.
    #[must_use]
    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.entries.get(user_id).map(|e| e.handle.clone())
    }

    /// Look up a user's full entry, including the online timestamp.
    #[must_use]
    pub fn entry(&self, user_id: &str) -> Option<ConnectionEntry> {
        self.entries.get(user_id).map(|e| e.clone())
    }

    /// Remove the entry whose connection matches, returning the user id.
    ///
    /// Used by disconnect reconciliation. Matching is on connection id, so
    /// a user who already re-registered on a newer connection is not
    /// evicted by the old connection's teardown. Returns `None` if the
    /// connection never registered.
    pub fn remove_by_connection(&self, connection_id: &str) -> Option<UserId> {
        let user_id = self.entries.iter().find_map(|e| {
            (e.handle.connection_id() == connection_id).then(|| e.key().clone())
        })?;
        self.entries.remove(&user_id);
        debug!(user = %user_id, connection = %connection_id, "User removed from registry");
        Some(user_id)
    }

    /// Send an event to a user, dropping it silently if they are offline.
    ///
    /// Returns `true` only if the user was reachable and the event was
    /// queued.
    pub fn send_to(&self, user_id: &str, event: ServerEvent) -> bool {
        match self.lookup(user_id) {
            Some(handle) => handle.send(event),
            None => {
                trace!(user = %user_id, event = %event.name(), "Target offline, event dropped");
                false
            }
        }
    }

    /// Broadcast an event to every online connection.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        self.entries
            .iter()
            .filter(|e| e.handle.send(event.clone()))
            .count()
    }

    /// Broadcast an event to every online connection except one.
    pub fn broadcast_except(&self, connection_id: &str, event: &ServerEvent) -> usize {
        self.entries
            .iter()
            .filter(|e| e.handle.connection_id() != connection_id)
            .filter(|e| e.handle.send(event.clone()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_protocol::PresenceStatus;

    fn handle(conn: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(conn, tx), rx)
    }

    #[test]
    fn test_set_online_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = handle("conn-1");

        assert!(registry.set_online("alice", h).is_none());
        let found = registry.lookup("alice").unwrap();
        assert_eq!(found.connection_id(), "conn-1");
        assert!(registry.lookup("bob").is_none());
    }

    #[test]
    fn test_last_connect_wins() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = handle("conn-1");
        let (h2, _rx2) = handle("conn-2");

        registry.set_online("alice", h1);
        let displaced = registry.set_online("alice", h2).unwrap();

        assert_eq!(displaced.handle.connection_id(), "conn-1");
        assert_eq!(registry.lookup("alice").unwrap().connection_id(), "conn-2");
        assert_eq!(registry.online_count(), 1);
    }

    #[test]
    fn test_remove_by_connection() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = handle("conn-1");
        registry.set_online("alice", h);

        assert_eq!(registry.remove_by_connection("conn-1").as_deref(), Some("alice"));
        assert!(registry.lookup("alice").is_none());

        // Unknown connections are tolerated
        assert!(registry.remove_by_connection("conn-unknown").is_none());
    }

    #[test]
    fn test_stale_connection_does_not_evict_new_entry() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = handle("conn-1");
        let (h2, _rx2) = handle("conn-2");

        registry.set_online("alice", h1);
        registry.set_online("alice", h2);

        // The old connection's teardown must not remove the new entry
        assert!(registry.remove_by_connection("conn-1").is_none());
        assert_eq!(registry.lookup("alice").unwrap().connection_id(), "conn-2");
    }

    #[test]
    fn test_send_to_offline_is_silent() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to(
            "ghost",
            ServerEvent::user_status("ghost", PresenceStatus::Online)
        ));
    }

    #[tokio::test]
    async fn test_broadcast_except() {
        let registry = ConnectionRegistry::new();
        let (h1, mut rx1) = handle("conn-1");
        let (h2, mut rx2) = handle("conn-2");
        registry.set_online("alice", h1);
        registry.set_online("bob", h2);

        let event = ServerEvent::user_status("alice", PresenceStatus::Online);
        let delivered = registry.broadcast_except("conn-1", &event);

        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }
}
