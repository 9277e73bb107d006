//! Group meeting session state machine.
//!
//! A meeting is active from `start` until exactly one `end` transition.
//! The authoritative record (participant history, timing) lives in the
//! store; this manager holds only the room-to-group association and the
//! meeting channel routing while the session is live. Persistence failures
//! are logged and the routing side effects proceed regardless.

use crate::channel::{meeting_channel, ChannelMap};
use crate::ids::now_millis;
use crate::registry::ConnectionHandle;
use crate::store::{MeetingRecord, MeetingStatus, ParticipantUpdate, SessionStore};
use dashmap::DashMap;
use std::sync::Arc;
use tether_protocol::ServerEvent;
use tracing::{debug, trace, warn};

/// Manager for group meeting sessions.
pub struct MeetingManager {
    store: Arc<dyn SessionStore>,
    channels: Arc<ChannelMap>,
    /// Live room-to-group associations; routing only, not authoritative.
    live: DashMap<String, String>,
}

impl MeetingManager {
    /// Create a manager over the shared channel table and store.
    #[must_use]
    pub fn new(channels: Arc<ChannelMap>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            channels,
            live: DashMap::new(),
        }
    }

    /// Number of live meetings.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// The group a live meeting belongs to.
    #[must_use]
    pub fn live_group(&self, room_id: &str) -> Option<String> {
        self.live.get(room_id).map(|g| g.clone())
    }

    /// Start a meeting: persist the record with the initiator as first
    /// participant, join the initiator to the meeting channel, and announce
    /// `group-meeting-started` on the parent group channel.
    pub async fn start(
        &self,
        group_id: &str,
        user_id: &str,
        user_name: Option<String>,
        room_id: &str,
        handle: ConnectionHandle,
    ) {
        let start_time = now_millis();
        let record = MeetingRecord::new(room_id, group_id, user_id, start_time);
        if let Err(e) = self.store.create_meeting(record).await {
            warn!(room = %room_id, error = %e, "Failed to persist meeting");
        }

        self.live.insert(room_id.to_string(), group_id.to_string());
        self.channels.join(&meeting_channel(room_id), handle);

        self.channels.broadcast(
            &crate::channel::group_channel(group_id),
            &ServerEvent::GroupMeetingStarted {
                room_id: room_id.to_string(),
                initiator_id: user_id.to_string(),
                initiator_name: user_name,
                timestamp: start_time,
            },
        );
        debug!(room = %room_id, group = %group_id, initiator = %user_id, "Meeting started");
    }

    /// Join a meeting: append a fresh participant record (rejoining after a
    /// leave appends, never mutates the closed record) and announce
    /// `participant-joined` to the meeting channel.
    pub async fn join(
        &self,
        room_id: &str,
        user_id: &str,
        user_name: Option<String>,
        handle: ConnectionHandle,
    ) {
        let joined_at = now_millis();
        self.channels.join(&meeting_channel(room_id), handle);

        if let Err(e) = self
            .store
            .update_meeting_participants(
                room_id,
                ParticipantUpdate::Join {
                    user_id: user_id.to_string(),
                    joined_at,
                },
            )
            .await
        {
            warn!(room = %room_id, user = %user_id, error = %e, "Failed to persist meeting join");
        }

        self.channels.broadcast(
            &meeting_channel(room_id),
            &ServerEvent::ParticipantJoined {
                user_id: user_id.to_string(),
                user_name,
                timestamp: joined_at,
            },
        );
        debug!(room = %room_id, user = %user_id, "Participant joined meeting");
    }

    /// Leave a meeting: close the user's open participant record, announce
    /// `participant-left` (the leaver still hears it), then detach the
    /// connection from the meeting channel.
    pub async fn leave(&self, room_id: &str, user_id: &str, connection_id: &str) {
        self.close_participant(room_id, user_id).await;
        self.channels.leave(&meeting_channel(room_id), connection_id);
        debug!(room = %room_id, user = %user_id, "Participant left meeting");
    }

    /// Disconnect-path leave: the connection is already gone from the
    /// channel table, so only the record close and the announcement to the
    /// remaining members happen here.
    pub async fn reconcile_disconnect(&self, room_id: &str, user_id: &str) {
        self.close_participant(room_id, user_id).await;
        debug!(room = %room_id, user = %user_id, "Participant reconciled after disconnect");
    }

    async fn close_participant(&self, room_id: &str, user_id: &str) {
        let left_at = now_millis();
        if let Err(e) = self
            .store
            .update_meeting_participants(
                room_id,
                ParticipantUpdate::Leave {
                    user_id: user_id.to_string(),
                    left_at,
                },
            )
            .await
        {
            warn!(room = %room_id, user = %user_id, error = %e, "Failed to persist meeting leave");
        }

        self.channels.broadcast(
            &meeting_channel(room_id),
            &ServerEvent::participant_left(user_id, left_at),
        );
    }

    /// End a meeting: compute the final timing once, persist it, announce
    /// `group-meeting-ended`, then tear the meeting channel down
    /// unconditionally (members who never sent a leave are detached too).
    ///
    /// Ending an unknown or already-ended meeting is a no-op. The store's
    /// compare-and-set finalize arbitrates racing ends: only the winner
    /// broadcasts and tears the channel down, and the recorded timing is
    /// never overwritten. Returns the computed duration in minutes when
    /// this call performed the end transition.
    pub async fn end(&self, room_id: &str) -> Option<u64> {
        let end_time = now_millis();

        let meeting = match self.store.find_meeting(room_id).await {
            Ok(m) => m,
            Err(e) => {
                warn!(room = %room_id, error = %e, "Meeting lookup failed during end");
                None
            }
        };
        let record_found = meeting.is_some();

        let duration_minutes = match meeting {
            Some(m) if m.status == MeetingStatus::Active => {
                let duration = end_time.saturating_sub(m.start_time) / 60_000;
                match self
                    .store
                    .finalize_meeting(room_id, end_time, duration)
                    .await
                {
                    Ok(true) => Some(duration),
                    Ok(false) => {
                        trace!(room = %room_id, "End lost the finalize race");
                        None
                    }
                    Err(e) => {
                        warn!(room = %room_id, error = %e, "Failed to finalize meeting");
                        Some(duration)
                    }
                }
            }
            Some(_) => {
                trace!(room = %room_id, "End for already-ended meeting");
                None
            }
            None => None,
        };

        // A live entry without a store record can only mean the create
        // failed earlier; the atomic remove picks a single winner there too.
        let was_live = self.live.remove(room_id).is_some();
        if duration_minutes.is_some() || (!record_found && was_live) {
            let channel = meeting_channel(room_id);
            self.channels.broadcast(
                &channel,
                &ServerEvent::GroupMeetingEnded {
                    room_id: room_id.to_string(),
                    timestamp: end_time,
                },
            );
            self.channels.remove(&channel);
            debug!(room = %room_id, duration = ?duration_minutes, "Meeting ended");
        }

        duration_minutes
    }
}
