//! Event catalog for the Tether protocol.
//!
//! Events are the unit of communication between clients and the server.
//! Each event is a JSON object with an `event` name and a `data` payload,
//! mirroring the shape of the original socket-style transport.

use serde::{Deserialize, Serialize};

/// Presence status carried by `user-status` broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Media kind of a one-to-one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

/// An inbound event from a client connection.
///
/// Payload fields use the wire's camelCase names; WebRTC negotiation
/// payloads (`offer`, `answer`, `candidate`) are opaque JSON relayed
/// verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Register the caller as online under the given user id.
    #[serde(rename_all = "camelCase")]
    UserOnline { user_id: String },

    /// Point-to-point chat delivery. The message body and timestamp are
    /// relayed untouched.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        sender_id: String,
        receiver_id: String,
        message: serde_json::Value,
        timestamp: serde_json::Value,
    },

    #[serde(rename_all = "camelCase")]
    UserTyping {
        sender_id: String,
        receiver_id: String,
    },

    #[serde(rename_all = "camelCase")]
    UserStopTyping {
        sender_id: String,
        receiver_id: String,
    },

    /// Start ringing a one-to-one call.
    #[serde(rename_all = "camelCase")]
    InitiateCall {
        caller_id: String,
        receiver_id: String,
        call_type: CallType,
        #[serde(default)]
        caller_name: Option<String>,
        #[serde(default)]
        caller_photo: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    AcceptCall {
        room_id: String,
        receiver_id: String,
        caller_id: String,
    },

    #[serde(rename_all = "camelCase")]
    SendOffer {
        receiver_id: String,
        offer: serde_json::Value,
        room_id: String,
    },

    #[serde(rename_all = "camelCase")]
    SendAnswer {
        caller_id: String,
        answer: serde_json::Value,
        room_id: String,
    },

    #[serde(rename_all = "camelCase")]
    SendIceCandidate {
        to_user_id: String,
        candidate: serde_json::Value,
        room_id: String,
    },

    #[serde(rename_all = "camelCase")]
    RejectCall { room_id: String, caller_id: String },

    #[serde(rename_all = "camelCase")]
    EndCall {
        room_id: String,
        other_user_id: String,
    },

    #[serde(rename_all = "camelCase")]
    JoinGroup { group_id: String, user_id: String },

    #[serde(rename_all = "camelCase")]
    LeaveGroup { group_id: String, user_id: String },

    /// Group chat message; optional media references ride along.
    #[serde(rename_all = "camelCase")]
    GroupMessage {
        group_id: String,
        sender_id: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        image: Option<String>,
        #[serde(default)]
        video: Option<String>,
        #[serde(default)]
        sender_name: Option<String>,
        #[serde(default)]
        sender_photo: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    StartGroupMeeting {
        group_id: String,
        user_id: String,
        room_id: String,
        #[serde(default)]
        user_name: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    JoinGroupMeeting {
        room_id: String,
        user_id: String,
        #[serde(default)]
        user_name: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    LeaveGroupMeeting { room_id: String, user_id: String },

    #[serde(rename_all = "camelCase")]
    EndGroupMeeting { room_id: String },
}

/// An outbound event delivered to a client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Presence change broadcast; the only globally fanned-out event.
    #[serde(rename_all = "camelCase")]
    UserStatus {
        user_id: String,
        status: PresenceStatus,
    },

    #[serde(rename_all = "camelCase")]
    ReceiveMessage {
        sender_id: String,
        message: serde_json::Value,
        timestamp: serde_json::Value,
        read: bool,
    },

    #[serde(rename_all = "camelCase")]
    UserTyping { user_id: String },

    #[serde(rename_all = "camelCase")]
    UserStopTyping { user_id: String },

    #[serde(rename_all = "camelCase")]
    IncomingCall {
        caller_id: String,
        room_id: String,
        call_type: CallType,
        #[serde(skip_serializing_if = "Option::is_none")]
        caller_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        caller_photo: Option<String>,
    },

    /// Sent back to a caller whose receiver is not reachable.
    #[serde(rename_all = "camelCase")]
    UserOffline { receiver_id: String },

    #[serde(rename_all = "camelCase")]
    CallAccepted { room_id: String, receiver_id: String },

    #[serde(rename_all = "camelCase")]
    ReceiveOffer {
        offer: serde_json::Value,
        room_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ReceiveAnswer {
        answer: serde_json::Value,
        room_id: String,
    },

    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: serde_json::Value,
        room_id: String,
    },

    #[serde(rename_all = "camelCase")]
    CallRejected { room_id: String },

    #[serde(rename_all = "camelCase")]
    CallEnded { room_id: String },

    #[serde(rename_all = "camelCase")]
    UserJoinedGroup { user_id: String, timestamp: u64 },

    #[serde(rename_all = "camelCase")]
    UserLeftGroup { user_id: String, timestamp: u64 },

    #[serde(rename_all = "camelCase")]
    GroupMessageReceived {
        id: String,
        group_id: String,
        sender_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_photo: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        image: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        video: Option<String>,
        created_at: u64,
    },

    #[serde(rename_all = "camelCase")]
    GroupMeetingStarted {
        room_id: String,
        initiator_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        initiator_name: Option<String>,
        timestamp: u64,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        timestamp: u64,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantLeft { user_id: String, timestamp: u64 },

    #[serde(rename_all = "camelCase")]
    GroupMeetingEnded { room_id: String, timestamp: u64 },
}

impl ClientEvent {
    /// Get the wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::UserOnline { .. } => "user-online",
            ClientEvent::SendMessage { .. } => "send-message",
            ClientEvent::UserTyping { .. } => "user-typing",
            ClientEvent::UserStopTyping { .. } => "user-stop-typing",
            ClientEvent::InitiateCall { .. } => "initiate-call",
            ClientEvent::AcceptCall { .. } => "accept-call",
            ClientEvent::SendOffer { .. } => "send-offer",
            ClientEvent::SendAnswer { .. } => "send-answer",
            ClientEvent::SendIceCandidate { .. } => "send-ice-candidate",
            ClientEvent::RejectCall { .. } => "reject-call",
            ClientEvent::EndCall { .. } => "end-call",
            ClientEvent::JoinGroup { .. } => "join-group",
            ClientEvent::LeaveGroup { .. } => "leave-group",
            ClientEvent::GroupMessage { .. } => "group-message",
            ClientEvent::StartGroupMeeting { .. } => "start-group-meeting",
            ClientEvent::JoinGroupMeeting { .. } => "join-group-meeting",
            ClientEvent::LeaveGroupMeeting { .. } => "leave-group-meeting",
            ClientEvent::EndGroupMeeting { .. } => "end-group-meeting",
        }
    }
}

impl ServerEvent {
    /// Get the wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::UserStatus { .. } => "user-status",
            ServerEvent::ReceiveMessage { .. } => "receive-message",
            ServerEvent::UserTyping { .. } => "user-typing",
            ServerEvent::UserStopTyping { .. } => "user-stop-typing",
            ServerEvent::IncomingCall { .. } => "incoming-call",
            ServerEvent::UserOffline { .. } => "user-offline",
            ServerEvent::CallAccepted { .. } => "call-accepted",
            ServerEvent::ReceiveOffer { .. } => "receive-offer",
            ServerEvent::ReceiveAnswer { .. } => "receive-answer",
            ServerEvent::IceCandidate { .. } => "ice-candidate",
            ServerEvent::CallRejected { .. } => "call-rejected",
            ServerEvent::CallEnded { .. } => "call-ended",
            ServerEvent::UserJoinedGroup { .. } => "user-joined-group",
            ServerEvent::UserLeftGroup { .. } => "user-left-group",
            ServerEvent::GroupMessageReceived { .. } => "group-message-received",
            ServerEvent::GroupMeetingStarted { .. } => "group-meeting-started",
            ServerEvent::ParticipantJoined { .. } => "participant-joined",
            ServerEvent::ParticipantLeft { .. } => "participant-left",
            ServerEvent::GroupMeetingEnded { .. } => "group-meeting-ended",
        }
    }

    /// Create a `user-status` broadcast.
    #[must_use]
    pub fn user_status(user_id: impl Into<String>, status: PresenceStatus) -> Self {
        ServerEvent::UserStatus {
            user_id: user_id.into(),
            status,
        }
    }

    /// Create a `call-ended` notification.
    #[must_use]
    pub fn call_ended(room_id: impl Into<String>) -> Self {
        ServerEvent::CallEnded {
            room_id: room_id.into(),
        }
    }

    /// Create a `participant-left` notification.
    #[must_use]
    pub fn participant_left(user_id: impl Into<String>, timestamp: u64) -> Self {
        ServerEvent::ParticipantLeft {
            user_id: user_id.into(),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_wire_shape() {
        let raw = json!({
            "event": "initiate-call",
            "data": {
                "callerId": "alice",
                "receiverId": "bob",
                "callType": "video",
                "callerName": "Alice",
                "callerPhoto": "https://cdn/x.png"
            }
        });

        let event: ClientEvent = serde_json::from_value(raw).unwrap();
        match event {
            ClientEvent::InitiateCall {
                caller_id,
                receiver_id,
                call_type,
                ..
            } => {
                assert_eq!(caller_id, "alice");
                assert_eq!(receiver_id, "bob");
                assert_eq!(call_type, CallType::Video);
            }
            other => panic!("Unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_server_event_wire_shape() {
        let event = ServerEvent::user_status("alice", PresenceStatus::Offline);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(
            value,
            json!({
                "event": "user-status",
                "data": { "userId": "alice", "status": "offline" }
            })
        );
    }

    #[test]
    fn test_optional_fields_omitted() {
        let event = ServerEvent::IncomingCall {
            caller_id: "alice".into(),
            room_id: "room-1".into(),
            call_type: CallType::Audio,
            caller_name: None,
            caller_photo: None,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert!(value["data"].get("callerName").is_none());
        assert!(value["data"].get("callerPhoto").is_none());
    }

    #[test]
    fn test_opaque_signaling_payload_roundtrip() {
        let offer = json!({"type": "offer", "sdp": "v=0\r\no=- 46117..."});
        let raw = json!({
            "event": "send-offer",
            "data": { "receiverId": "bob", "offer": offer, "roomId": "r1" }
        });

        let event: ClientEvent = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&event).unwrap(), raw);
    }

    #[test]
    fn test_event_names() {
        let event = ClientEvent::EndGroupMeeting {
            room_id: "r1".into(),
        };
        assert_eq!(event.name(), "end-group-meeting");

        let event = ServerEvent::participant_left("bob", 1);
        assert_eq!(event.name(), "participant-left");
    }
}
