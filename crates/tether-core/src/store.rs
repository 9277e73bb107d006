//! Data-store collaborator interface.
//!
//! The store holds the authoritative copies of groups, group messages, and
//! meeting records. The coordination layer treats it as an external
//! collaborator: every call is a simple create/read/update primitive with
//! no cross-entity guarantees, and persistence failures are logged while
//! routing side effects proceed (eventual consistency by design).

use crate::ids::generate_record_id;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend failed.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Meeting lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingStatus {
    Active,
    Ended,
}

/// One join/leave record in a meeting's participant history.
///
/// Records are append-only: a user who rejoins gets a fresh record rather
/// than a mutation of the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    /// Join time, milliseconds since the Unix epoch.
    pub joined_at: u64,
    /// Leave time; absent while the participant is still in the meeting.
    pub left_at: Option<u64>,
}

/// A group meeting record.
///
/// The authoritative copy lives in the store; the in-memory side holds only
/// the routing association while the meeting is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingRecord {
    pub room_id: String,
    pub group_id: String,
    pub initiator_id: String,
    pub participants: Vec<Participant>,
    pub start_time: u64,
    pub end_time: Option<u64>,
    /// Computed once at the end transition, never recomputed.
    pub duration_minutes: Option<u64>,
    pub status: MeetingStatus,
}

impl MeetingRecord {
    /// Create a new active meeting with the initiator as first participant.
    #[must_use]
    pub fn new(
        room_id: impl Into<String>,
        group_id: impl Into<String>,
        initiator_id: impl Into<String>,
        start_time: u64,
    ) -> Self {
        let initiator_id = initiator_id.into();
        Self {
            room_id: room_id.into(),
            group_id: group_id.into(),
            initiator_id: initiator_id.clone(),
            participants: vec![Participant {
                user_id: initiator_id,
                joined_at: start_time,
                left_at: None,
            }],
            start_time,
            end_time: None,
            duration_minutes: None,
            status: MeetingStatus::Active,
        }
    }
}

/// A mutation to a meeting's participant history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantUpdate {
    /// Append a fresh join record.
    Join { user_id: String, joined_at: u64 },
    /// Close the most recent open record for the user.
    Leave { user_id: String, left_at: u64 },
}

/// An authoritative group, as far as this layer cares: who may join its
/// channel. Everything else about groups is out of scope here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub group_id: String,
    pub name: String,
    pub members: Vec<String>,
}

/// A stored group message; write-once, never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessageRecord {
    pub id: String,
    pub group_id: String,
    pub sender_id: String,
    pub text: Option<String>,
    pub image: Option<String>,
    pub video: Option<String>,
    pub created_at: u64,
}

/// A group message about to be persisted.
#[derive(Debug, Clone)]
pub struct NewGroupMessage {
    pub group_id: String,
    pub sender_id: String,
    pub text: Option<String>,
    pub image: Option<String>,
    pub video: Option<String>,
    pub created_at: u64,
}

/// The persistence collaborator.
///
/// Implementations must make `update_meeting_participants` atomic per
/// meeting: two concurrent joins must both land in the participant list.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a group message, returning the stored record with its id.
    async fn create_group_message(
        &self,
        message: NewGroupMessage,
    ) -> Result<GroupMessageRecord, StoreError>;

    /// Persist a new meeting record.
    async fn create_meeting(&self, meeting: MeetingRecord) -> Result<(), StoreError>;

    /// Apply a participant join/leave to a meeting's history.
    async fn update_meeting_participants(
        &self,
        room_id: &str,
        update: ParticipantUpdate,
    ) -> Result<(), StoreError>;

    /// Mark a meeting ended with its final timing.
    ///
    /// The transition is compare-and-set: returns `true` if this call moved
    /// the meeting from active to ended, `false` if it had already ended.
    /// Exactly one caller wins when ends race.
    async fn finalize_meeting(
        &self,
        room_id: &str,
        end_time: u64,
        duration_minutes: u64,
    ) -> Result<bool, StoreError>;

    /// Fetch a group, if it exists.
    async fn find_group(&self, group_id: &str) -> Result<Option<GroupRecord>, StoreError>;

    /// Fetch a meeting, if it exists.
    async fn find_meeting(&self, room_id: &str) -> Result<Option<MeetingRecord>, StoreError>;
}

/// In-memory store backed by concurrent maps.
///
/// The reference implementation used by the server binary and tests; a
/// database-backed store drops in behind the same trait. Per-entry locking
/// makes participant updates atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    groups: DashMap<String, GroupRecord>,
    messages: DashMap<String, GroupMessageRecord>,
    meetings: DashMap<String, MeetingRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a group (test and bootstrap convenience).
    pub fn insert_group(&self, group: GroupRecord) {
        self.groups.insert(group.group_id.clone(), group);
    }

    /// Number of stored group messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_group_message(
        &self,
        message: NewGroupMessage,
    ) -> Result<GroupMessageRecord, StoreError> {
        let record = GroupMessageRecord {
            id: generate_record_id(),
            group_id: message.group_id,
            sender_id: message.sender_id,
            text: message.text,
            image: message.image,
            video: message.video,
            created_at: message.created_at,
        };
        self.messages.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn create_meeting(&self, meeting: MeetingRecord) -> Result<(), StoreError> {
        self.meetings.insert(meeting.room_id.clone(), meeting);
        Ok(())
    }

    async fn update_meeting_participants(
        &self,
        room_id: &str,
        update: ParticipantUpdate,
    ) -> Result<(), StoreError> {
        let mut meeting = self
            .meetings
            .get_mut(room_id)
            .ok_or_else(|| StoreError::NotFound(room_id.to_string()))?;

        match update {
            ParticipantUpdate::Join { user_id, joined_at } => {
                meeting.participants.push(Participant {
                    user_id,
                    joined_at,
                    left_at: None,
                });
            }
            ParticipantUpdate::Leave { user_id, left_at } => {
                if let Some(open) = meeting
                    .participants
                    .iter_mut()
                    .rev()
                    .find(|p| p.user_id == user_id && p.left_at.is_none())
                {
                    open.left_at = Some(left_at);
                }
            }
        }
        Ok(())
    }

    async fn finalize_meeting(
        &self,
        room_id: &str,
        end_time: u64,
        duration_minutes: u64,
    ) -> Result<bool, StoreError> {
        let mut meeting = self
            .meetings
            .get_mut(room_id)
            .ok_or_else(|| StoreError::NotFound(room_id.to_string()))?;

        if meeting.status == MeetingStatus::Ended {
            return Ok(false);
        }
        meeting.end_time = Some(end_time);
        meeting.duration_minutes = Some(duration_minutes);
        meeting.status = MeetingStatus::Ended;
        Ok(true)
    }

    async fn find_group(&self, group_id: &str) -> Result<Option<GroupRecord>, StoreError> {
        Ok(self.groups.get(group_id).map(|g| g.clone()))
    }

    async fn find_meeting(&self, room_id: &str) -> Result<Option<MeetingRecord>, StoreError> {
        Ok(self.meetings.get(room_id).map(|m| m.clone()))
    }
}
