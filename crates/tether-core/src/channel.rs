//! Broadcast channels for group and meeting routing.
//!
//! A channel is a runtime routing group that connections join and leave;
//! it is distinct from authoritative group membership in the store. Channel
//! lifetime is the union of its members' connection lifetimes: channels are
//! created on first join and deleted when the last member leaves.
//!
//! All mutation and fan-out for one channel goes through its map entry, so
//! concurrent join/leave/broadcast on the same channel serialize through
//! one short critical section and no membership update is lost.

use crate::registry::{ConnectionHandle, ConnectionId};
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use tether_protocol::ServerEvent;
use tracing::{debug, trace};

/// Channel name for a group's chat routing.
#[must_use]
pub fn group_channel(group_id: &str) -> String {
    format!("group-{group_id}")
}

/// Channel name for a meeting's routing.
#[must_use]
pub fn meeting_channel(room_id: &str) -> String {
    format!("meeting-{room_id}")
}

/// Extract the room id from a meeting channel name, if it is one.
#[must_use]
pub fn meeting_room_id(channel: &str) -> Option<&str> {
    channel.strip_prefix("meeting-")
}

/// Extract the group id from a group channel name, if it is one.
#[must_use]
pub fn channel_group_id(channel: &str) -> Option<&str> {
    channel.strip_prefix("group-")
}

/// A single broadcast channel.
#[derive(Debug, Default)]
struct Channel {
    /// Members keyed by connection id.
    members: HashMap<ConnectionId, ConnectionHandle>,
}

impl Channel {
    fn join(&mut self, handle: ConnectionHandle) -> bool {
        self.members
            .insert(handle.connection_id().to_string(), handle)
            .is_none()
    }

    fn leave(&mut self, connection_id: &str) -> bool {
        self.members.remove(connection_id).is_some()
    }

    /// Fan an event out to every member, returning the delivered count.
    fn broadcast(&self, event: &ServerEvent) -> usize {
        self.members
            .values()
            .filter(|h| h.send(event.clone()))
            .count()
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// The channel table: named broadcast groups plus a reverse index from
/// connection to joined channels (used for disconnect cleanup).
#[derive(Debug, Default)]
pub struct ChannelMap {
    channels: DashMap<String, Channel>,
    memberships: DashMap<ConnectionId, DashSet<String>>,
}

impl ChannelMap {
    /// Create an empty channel table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of members in a channel.
    #[must_use]
    pub fn member_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|c| c.members.len())
            .unwrap_or(0)
    }

    /// Whether a connection is joined to a channel.
    #[must_use]
    pub fn is_member(&self, channel: &str, connection_id: &str) -> bool {
        self.channels
            .get(channel)
            .map(|c| c.members.contains_key(connection_id))
            .unwrap_or(false)
    }

    /// Join a connection to a channel, creating the channel if needed.
    ///
    /// Returns `true` if the connection was not already a member.
    pub fn join(&self, channel: &str, handle: ConnectionHandle) -> bool {
        let connection_id = handle.connection_id().to_string();
        let joined = self.channels.entry(channel.to_string()).or_default().join(handle);

        self.memberships
            .entry(connection_id.clone())
            .or_default()
            .insert(channel.to_string());

        if joined {
            debug!(channel = %channel, connection = %connection_id, "Joined channel");
        }
        joined
    }

    /// Remove a connection from a channel, deleting the channel if emptied.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&self, channel: &str, connection_id: &str) -> bool {
        if let Some(subs) = self.memberships.get(connection_id) {
            subs.remove(channel);
        }

        let Some(mut entry) = self.channels.get_mut(channel) else {
            return false;
        };
        let left = entry.leave(connection_id);
        let emptied = entry.is_empty();
        drop(entry);

        if emptied {
            self.channels.remove_if(channel, |_, c| c.is_empty());
            debug!(channel = %channel, "Deleted empty channel");
        }
        if left {
            debug!(channel = %channel, connection = %connection_id, "Left channel");
        }
        left
    }

    /// Remove a connection from every channel it joined.
    ///
    /// Returns the channel names it was removed from; the caller uses these
    /// to reconcile per-channel state (meeting records, leave announcements).
    pub fn leave_all(&self, connection_id: &str) -> Vec<String> {
        let Some((_, channels)) = self.memberships.remove(connection_id) else {
            return Vec::new();
        };

        let names: Vec<String> = channels.iter().map(|c| c.clone()).collect();
        for name in &names {
            if let Some(mut entry) = self.channels.get_mut(name) {
                entry.leave(connection_id);
                let emptied = entry.is_empty();
                drop(entry);
                if emptied {
                    self.channels.remove_if(name, |_, c| c.is_empty());
                }
            }
        }

        debug!(connection = %connection_id, channels = names.len(), "Left all channels");
        names
    }

    /// Broadcast an event to every member of a channel.
    ///
    /// Broadcasting to a non-existent channel delivers to nobody.
    pub fn broadcast(&self, channel: &str, event: &ServerEvent) -> usize {
        match self.channels.get(channel) {
            Some(c) => {
                let count = c.broadcast(event);
                trace!(channel = %channel, event = %event.name(), recipients = count, "Channel broadcast");
                count
            }
            None => {
                trace!(channel = %channel, event = %event.name(), "Broadcast to absent channel");
                0
            }
        }
    }

    /// Tear a channel down unconditionally, detaching every member.
    ///
    /// Returns the connection ids that were still joined. Used when a
    /// meeting ends regardless of individual leave state.
    pub fn remove(&self, channel: &str) -> Vec<ConnectionId> {
        let Some((_, removed)) = self.channels.remove(channel) else {
            return Vec::new();
        };

        let members: Vec<ConnectionId> = removed.members.keys().cloned().collect();
        for connection_id in &members {
            if let Some(subs) = self.memberships.get(connection_id) {
                subs.remove(channel);
            }
        }

        debug!(channel = %channel, detached = members.len(), "Channel removed");
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_protocol::PresenceStatus;
    use tokio::sync::mpsc;

    fn handle(conn: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(conn, tx), rx)
    }

    fn event() -> ServerEvent {
        ServerEvent::user_status("x", PresenceStatus::Online)
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(group_channel("g1"), "group-g1");
        assert_eq!(meeting_channel("r1"), "meeting-r1");
        assert_eq!(meeting_room_id("meeting-r1"), Some("r1"));
        assert_eq!(meeting_room_id("group-g1"), None);
        assert_eq!(channel_group_id("group-g1"), Some("g1"));
    }

    #[tokio::test]
    async fn test_join_broadcast_leave() {
        let channels = ChannelMap::new();
        let (h1, mut rx1) = handle("conn-1");
        let (h2, mut rx2) = handle("conn-2");

        assert!(channels.join("group-g1", h1));
        assert!(channels.join("group-g1", h2));
        assert_eq!(channels.member_count("group-g1"), 2);

        assert_eq!(channels.broadcast("group-g1", &event()), 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());

        assert!(channels.leave("group-g1", "conn-1"));
        assert_eq!(channels.broadcast("group-g1", &event()), 1);
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn test_empty_channel_deleted() {
        let channels = ChannelMap::new();
        let (h, _rx) = handle("conn-1");

        channels.join("group-g1", h);
        assert_eq!(channels.channel_count(), 1);

        channels.leave("group-g1", "conn-1");
        assert_eq!(channels.channel_count(), 0);
    }

    #[test]
    fn test_leave_all_reports_channels() {
        let channels = ChannelMap::new();
        let (h, _rx) = handle("conn-1");

        channels.join("group-g1", h.clone());
        channels.join("meeting-r1", h);

        let mut left = channels.leave_all("conn-1");
        left.sort();
        assert_eq!(left, vec!["group-g1", "meeting-r1"]);
        assert_eq!(channels.channel_count(), 0);

        // A connection that joined nothing is tolerated
        assert!(channels.leave_all("conn-ghost").is_empty());
    }

    #[tokio::test]
    async fn test_remove_detaches_remaining_members() {
        let channels = ChannelMap::new();
        let (h1, _rx1) = handle("conn-1");
        let (h2, _rx2) = handle("conn-2");
        channels.join("meeting-r1", h1);
        channels.join("meeting-r1", h2);

        let mut detached = channels.remove("meeting-r1");
        detached.sort();
        assert_eq!(detached, vec!["conn-1", "conn-2"]);
        assert_eq!(channels.broadcast("meeting-r1", &event()), 0);

        // Reverse index is cleaned up too
        assert!(channels.leave_all("conn-1").is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_absent_channel_is_noop() {
        let channels = ChannelMap::new();
        assert_eq!(channels.broadcast("group-nowhere", &event()), 0);
    }
}
