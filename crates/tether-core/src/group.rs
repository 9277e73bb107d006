//! Group channel manager.
//!
//! Routes group chat and membership announcements through the channel
//! table. Channel membership is a presence/subscription concept; the
//! authoritative member list lives in the store and is only consulted as a
//! thin authorization check at join time. A stored member who never joined
//! the channel receives nothing, and that divergence is deliberate.

use crate::channel::{group_channel, ChannelMap};
use crate::ids::{generate_record_id, now_millis};
use crate::registry::ConnectionHandle;
use crate::store::{NewGroupMessage, SessionStore};
use std::sync::Arc;
use tether_protocol::ServerEvent;
use tracing::{debug, warn};

/// Manager for group-scoped broadcast channels.
pub struct GroupChannelManager {
    channels: Arc<ChannelMap>,
    store: Arc<dyn SessionStore>,
}

impl GroupChannelManager {
    /// Create a manager over the shared channel table and store.
    #[must_use]
    pub fn new(channels: Arc<ChannelMap>, store: Arc<dyn SessionStore>) -> Self {
        Self { channels, store }
    }

    /// Join a user's connection to a group channel.
    ///
    /// If the store knows the group and the user is not in its member list,
    /// the join is refused. An unknown group or a store failure does not
    /// block: channel membership is presence, not authorization, and
    /// routing correctness wins over strict consistency.
    ///
    /// On success, `user-joined-group` goes to all members including the
    /// joiner.
    pub async fn join(&self, group_id: &str, user_id: &str, handle: ConnectionHandle) -> bool {
        match self.store.find_group(group_id).await {
            Ok(Some(group)) if !group.members.iter().any(|m| m == user_id) => {
                warn!(group = %group_id, user = %user_id, "Join refused: not a group member");
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(group = %group_id, error = %e, "Group lookup failed, allowing join");
            }
        }

        let channel = group_channel(group_id);
        self.channels.join(&channel, handle);
        self.channels.broadcast(
            &channel,
            &ServerEvent::UserJoinedGroup {
                user_id: user_id.to_string(),
                timestamp: now_millis(),
            },
        );
        debug!(group = %group_id, user = %user_id, "User joined group channel");
        true
    }

    /// Remove a connection from a group channel and announce the departure
    /// to the remaining members.
    pub fn leave(&self, group_id: &str, user_id: &str, connection_id: &str) {
        let channel = group_channel(group_id);
        if self.channels.leave(&channel, connection_id) {
            self.channels.broadcast(
                &channel,
                &ServerEvent::UserLeftGroup {
                    user_id: user_id.to_string(),
                    timestamp: now_millis(),
                },
            );
            debug!(group = %group_id, user = %user_id, "User left group channel");
        }
    }

    /// Persist a group message and broadcast it to current channel members.
    ///
    /// Delivery is best-effort to whoever is joined to the channel right
    /// now. A persistence failure is logged and the broadcast proceeds with
    /// a locally generated record id.
    #[allow(clippy::too_many_arguments)]
    pub async fn broadcast_message(
        &self,
        group_id: &str,
        sender_id: &str,
        text: Option<String>,
        image: Option<String>,
        video: Option<String>,
        sender_name: Option<String>,
        sender_photo: Option<String>,
    ) -> usize {
        let created_at = now_millis();
        let message = NewGroupMessage {
            group_id: group_id.to_string(),
            sender_id: sender_id.to_string(),
            text: text.clone(),
            image: image.clone(),
            video: video.clone(),
            created_at,
        };

        let (id, created_at) = match self.store.create_group_message(message).await {
            Ok(record) => (record.id, record.created_at),
            Err(e) => {
                warn!(group = %group_id, error = %e, "Failed to persist group message");
                (generate_record_id(), created_at)
            }
        };

        self.channels.broadcast(
            &group_channel(group_id),
            &ServerEvent::GroupMessageReceived {
                id,
                group_id: group_id.to_string(),
                sender_id: sender_id.to_string(),
                sender_name,
                sender_photo,
                text,
                image,
                video,
                created_at,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GroupMessageRecord, GroupRecord, MemoryStore, StoreError};
    use async_trait::async_trait;
    use tether_protocol::ServerEvent;
    use tokio::sync::mpsc;

    fn handle(conn: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(conn, tx), rx)
    }

    fn manager_with_store(store: Arc<dyn SessionStore>) -> GroupChannelManager {
        GroupChannelManager::new(Arc::new(ChannelMap::new()), store)
    }

    #[tokio::test]
    async fn test_join_announces_to_all_including_joiner() {
        let groups = manager_with_store(Arc::new(MemoryStore::new()));
        let (h1, mut rx1) = handle("conn-1");
        let (h2, mut rx2) = handle("conn-2");

        assert!(groups.join("g1", "alice", h1).await);
        rx1.try_recv().unwrap(); // alice sees her own join

        assert!(groups.join("g1", "bob", h2).await);
        assert!(matches!(
            rx1.try_recv().unwrap(),
            ServerEvent::UserJoinedGroup { user_id, .. } if user_id == "bob"
        ));
        assert!(matches!(
            rx2.try_recv().unwrap(),
            ServerEvent::UserJoinedGroup { user_id, .. } if user_id == "bob"
        ));
    }

    #[tokio::test]
    async fn test_join_refused_for_non_member_of_known_group() {
        let store = MemoryStore::new();
        store.insert_group(GroupRecord {
            group_id: "g1".into(),
            name: "Team".into(),
            members: vec!["alice".into()],
        });
        let groups = manager_with_store(Arc::new(store));

        let (h, _rx) = handle("conn-1");
        assert!(!groups.join("g1", "mallory", h).await);
    }

    #[tokio::test]
    async fn test_leave_announces_to_remainder() {
        let groups = manager_with_store(Arc::new(MemoryStore::new()));
        let (h1, mut rx1) = handle("conn-1");
        let (h2, mut rx2) = handle("conn-2");
        groups.join("g1", "alice", h1).await;
        groups.join("g1", "bob", h2).await;
        while rx1.try_recv().is_ok() {}
        while rx2.try_recv().is_ok() {}

        groups.leave("g1", "bob", "conn-2");

        assert!(matches!(
            rx1.try_recv().unwrap(),
            ServerEvent::UserLeftGroup { user_id, .. } if user_id == "bob"
        ));
        // bob already left the channel and hears nothing
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_message_persisted_then_broadcast() {
        let store = Arc::new(MemoryStore::new());
        let groups = manager_with_store(store.clone());
        let (h, mut rx) = handle("conn-1");
        groups.join("g1", "alice", h).await;
        rx.try_recv().unwrap();

        let delivered = groups
            .broadcast_message("g1", "alice", Some("hi".into()), None, None, None, None)
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(store.message_count(), 1);
        match rx.try_recv().unwrap() {
            ServerEvent::GroupMessageReceived { id, text, .. } => {
                assert!(!id.is_empty());
                assert_eq!(text.as_deref(), Some("hi"));
            }
            other => panic!("Unexpected event: {other:?}"),
        }
    }

    /// Store that fails every write.
    struct BrokenStore;

    #[async_trait]
    impl SessionStore for BrokenStore {
        async fn create_group_message(
            &self,
            _message: NewGroupMessage,
        ) -> Result<GroupMessageRecord, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn create_meeting(
            &self,
            _meeting: crate::store::MeetingRecord,
        ) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn update_meeting_participants(
            &self,
            _room_id: &str,
            _update: crate::store::ParticipantUpdate,
        ) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn finalize_meeting(
            &self,
            _room_id: &str,
            _end_time: u64,
            _duration_minutes: u64,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn find_group(&self, _group_id: &str) -> Result<Option<GroupRecord>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn find_meeting(
            &self,
            _room_id: &str,
        ) -> Result<Option<crate::store::MeetingRecord>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_still_broadcasts() {
        let groups = manager_with_store(Arc::new(BrokenStore));
        let (h, mut rx) = handle("conn-1");
        groups.join("g1", "alice", h).await;
        rx.try_recv().unwrap();

        let delivered = groups
            .broadcast_message("g1", "alice", Some("hi".into()), None, None, None, None)
            .await;

        assert_eq!(delivered, 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerEvent::GroupMessageReceived { .. }
        ));
    }
}
