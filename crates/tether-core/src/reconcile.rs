//! Disconnect reconciliation.
//!
//! A connection can vanish without notice at any point. Reconciliation
//! removes the user from the registry, announces the offline status exactly
//! once, detaches the connection from every channel it had joined, closes
//! open meeting participation, and ends in-flight calls the user was party
//! to, so no ringing/active session is left stranded.

use crate::call::CallManager;
use crate::channel::{channel_group_id, meeting_room_id, ChannelMap};
use crate::ids::now_millis;
use crate::meeting::MeetingManager;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use tether_protocol::{PresenceStatus, ServerEvent};
use tracing::{debug, info};

/// Reconciles all shared state touched by a dropped connection.
pub struct DisconnectReconciler {
    registry: Arc<ConnectionRegistry>,
    channels: Arc<ChannelMap>,
    calls: Arc<CallManager>,
    meetings: Arc<MeetingManager>,
}

impl DisconnectReconciler {
    /// Create a reconciler over the shared state.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        channels: Arc<ChannelMap>,
        calls: Arc<CallManager>,
        meetings: Arc<MeetingManager>,
    ) -> Self {
        Self {
            registry,
            channels,
            calls,
            meetings,
        }
    }

    /// Clean up after a dropped connection.
    ///
    /// Safe to call for connections that never registered a user: channel
    /// cleanup still runs and nothing else happens. A user who already
    /// re-registered on a newer connection is untouched (registry removal
    /// matches on connection id).
    pub async fn handle_disconnect(&self, connection_id: &str) {
        let user_id = self.registry.remove_by_connection(connection_id);
        let left_channels = self.channels.leave_all(connection_id);

        let Some(user_id) = user_id else {
            debug!(connection = %connection_id, "Disconnect of unregistered connection");
            return;
        };

        // Exactly one offline broadcast per removed entry
        self.registry.broadcast_except(
            connection_id,
            &ServerEvent::user_status(&user_id, PresenceStatus::Offline),
        );

        for channel in &left_channels {
            if let Some(room_id) = meeting_room_id(channel) {
                self.meetings.reconcile_disconnect(room_id, &user_id).await;
            } else if channel_group_id(channel).is_some() {
                self.channels.broadcast(
                    channel,
                    &ServerEvent::UserLeftGroup {
                        user_id: user_id.clone(),
                        timestamp: now_millis(),
                    },
                );
            }
        }

        let ended_calls = self.calls.end_for_user(&user_id);

        info!(
            user = %user_id,
            connection = %connection_id,
            channels = left_channels.len(),
            calls_ended = ended_calls.len(),
            "User went offline"
        );
    }
}
