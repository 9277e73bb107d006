//! One-to-one call session state machine.
//!
//! Each call is keyed by a generated room id and moves monotonically
//! through ringing -> active -> ended (or ringing -> ended on rejection).
//! WebRTC negotiation payloads (offer/answer/ICE) are stateless
//! pass-through: they never mutate session state and may repeat freely
//! while a session is ringing or active.

use crate::ids::{generate_room_id, now_millis};
use crate::registry::ConnectionRegistry;
use dashmap::DashMap;
use std::sync::Arc;
use tether_protocol::{CallType, ServerEvent};
use tracing::{debug, trace};

/// A call room identifier.
pub type RoomId = String;

/// Lifecycle phase of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
}

impl CallStatus {
    /// Whether the state machine may move from `self` to `next`.
    ///
    /// Transitions only go forward; no event ever regresses status.
    #[must_use]
    pub fn can_advance_to(self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (CallStatus::Ringing, CallStatus::Active)
                | (CallStatus::Ringing, CallStatus::Ended)
                | (CallStatus::Active, CallStatus::Ended)
        )
    }
}

/// One pending or active call.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub room_id: RoomId,
    pub caller_id: String,
    pub receiver_id: String,
    pub call_type: CallType,
    pub status: CallStatus,
    pub created_at: u64,
}

impl CallSession {
    fn other_party(&self, user_id: &str) -> Option<&str> {
        if self.caller_id == user_id {
            Some(&self.receiver_id)
        } else if self.receiver_id == user_id {
            Some(&self.caller_id)
        } else {
            None
        }
    }
}

/// Manager of all live call sessions.
pub struct CallManager {
    sessions: DashMap<RoomId, CallSession>,
    registry: Arc<ConnectionRegistry>,
}

impl CallManager {
    /// Create a manager over the given registry.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
        }
    }

    /// Number of live (ringing or active) sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot a session for inspection.
    #[must_use]
    pub fn session(&self, room_id: &str) -> Option<CallSession> {
        self.sessions.get(room_id).map(|s| s.clone())
    }

    /// Start ringing a call.
    ///
    /// If the receiver is reachable, records a ringing session and delivers
    /// `incoming-call`; returns the generated room id. If the receiver is
    /// offline, no session is created and the caller alone gets a
    /// `user-offline` notice.
    pub fn initiate(
        &self,
        caller_id: &str,
        receiver_id: &str,
        call_type: CallType,
        caller_name: Option<String>,
        caller_photo: Option<String>,
    ) -> Option<RoomId> {
        let Some(receiver) = self.registry.lookup(receiver_id) else {
            debug!(caller = %caller_id, receiver = %receiver_id, "Call target offline");
            self.registry.send_to(
                caller_id,
                ServerEvent::UserOffline {
                    receiver_id: receiver_id.to_string(),
                },
            );
            return None;
        };

        let room_id = generate_room_id(caller_id, receiver_id);
        receiver.send(ServerEvent::IncomingCall {
            caller_id: caller_id.to_string(),
            room_id: room_id.clone(),
            call_type,
            caller_name,
            caller_photo,
        });

        self.sessions.insert(
            room_id.clone(),
            CallSession {
                room_id: room_id.clone(),
                caller_id: caller_id.to_string(),
                receiver_id: receiver_id.to_string(),
                call_type,
                status: CallStatus::Ringing,
                created_at: now_millis(),
            },
        );

        debug!(room = %room_id, caller = %caller_id, receiver = %receiver_id, "Call ringing");
        Some(room_id)
    }

    /// Accept a ringing call.
    ///
    /// Flips the session to active and notifies the caller. An unreachable
    /// caller still flips the state (accepted-but-undeliverable is
    /// tolerated). Duplicate accepts on an active session are idempotent
    /// and re-send the notification. Unknown rooms are no-ops.
    pub fn accept(&self, room_id: &str, receiver_id: &str, caller_id: &str) {
        let Some(mut session) = self.sessions.get_mut(room_id) else {
            trace!(room = %room_id, "Accept for unknown room");
            return;
        };

        match session.status {
            CallStatus::Ringing => {
                session.status = CallStatus::Active;
                debug!(room = %room_id, "Call active");
            }
            CallStatus::Active => {
                trace!(room = %room_id, "Duplicate accept");
            }
            CallStatus::Ended => return,
        }
        drop(session);

        self.registry.send_to(
            caller_id,
            ServerEvent::CallAccepted {
                room_id: room_id.to_string(),
                receiver_id: receiver_id.to_string(),
            },
        );
    }

    /// Reject a ringing call: notify the caller if reachable, discard the
    /// session. Unknown rooms still deliver the rejection notice.
    pub fn reject(&self, room_id: &str, caller_id: &str) {
        self.registry.send_to(
            caller_id,
            ServerEvent::CallRejected {
                room_id: room_id.to_string(),
            },
        );
        if self.sessions.remove(room_id).is_some() {
            debug!(room = %room_id, "Call rejected");
        }
    }

    /// End a call: notify the other party if reachable, discard the session.
    pub fn end(&self, room_id: &str, other_user_id: &str) {
        self.registry
            .send_to(other_user_id, ServerEvent::call_ended(room_id));
        if self.sessions.remove(room_id).is_some() {
            debug!(room = %room_id, "Call ended");
        }
    }

    /// Relay a WebRTC offer to the receiver. Stateless pass-through.
    pub fn forward_offer(&self, receiver_id: &str, offer: serde_json::Value, room_id: &str) {
        self.registry.send_to(
            receiver_id,
            ServerEvent::ReceiveOffer {
                offer,
                room_id: room_id.to_string(),
            },
        );
    }

    /// Relay a WebRTC answer back to the caller. Stateless pass-through.
    pub fn forward_answer(&self, caller_id: &str, answer: serde_json::Value, room_id: &str) {
        self.registry.send_to(
            caller_id,
            ServerEvent::ReceiveAnswer {
                answer,
                room_id: room_id.to_string(),
            },
        );
    }

    /// Relay an ICE candidate to either party. Stateless pass-through.
    pub fn forward_candidate(&self, to_user_id: &str, candidate: serde_json::Value, room_id: &str) {
        self.registry.send_to(
            to_user_id,
            ServerEvent::IceCandidate {
                candidate,
                room_id: room_id.to_string(),
            },
        );
    }

    /// Discard every session a user is party to, notifying the opposite
    /// party with `call-ended`. Returns the affected room ids.
    ///
    /// Disconnect reconciliation path: without this, a vanished participant
    /// would leave ringing/active sessions stranded.
    pub fn end_for_user(&self, user_id: &str) -> Vec<RoomId> {
        let rooms: Vec<RoomId> = self
            .sessions
            .iter()
            .filter(|s| s.other_party(user_id).is_some())
            .map(|s| s.key().clone())
            .collect();

        for room_id in &rooms {
            if let Some((_, session)) = self.sessions.remove(room_id) {
                if let Some(other) = session.other_party(user_id) {
                    self.registry.send_to(other, ServerEvent::call_ended(room_id));
                }
                debug!(room = %room_id, user = %user_id, "Call ended by disconnect");
            }
        }
        rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionHandle;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        calls: CallManager,
        registry: Arc<ConnectionRegistry>,
        alice_rx: mpsc::UnboundedReceiver<ServerEvent>,
        bob_rx: mpsc::UnboundedReceiver<ServerEvent>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let (alice_tx, alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, bob_rx) = mpsc::unbounded_channel();
        registry.set_online("alice", ConnectionHandle::new("conn-alice", alice_tx));
        registry.set_online("bob", ConnectionHandle::new("conn-bob", bob_tx));

        Fixture {
            calls: CallManager::new(registry.clone()),
            registry,
            alice_rx,
            bob_rx,
        }
    }

    fn ring(f: &mut Fixture) -> RoomId {
        let room = f
            .calls
            .initiate("alice", "bob", CallType::Video, None, None)
            .unwrap();
        // drain the incoming-call notification
        f.bob_rx.try_recv().unwrap();
        room
    }

    #[test]
    fn test_status_transitions_forward_only() {
        assert!(CallStatus::Ringing.can_advance_to(CallStatus::Active));
        assert!(CallStatus::Ringing.can_advance_to(CallStatus::Ended));
        assert!(CallStatus::Active.can_advance_to(CallStatus::Ended));

        assert!(!CallStatus::Active.can_advance_to(CallStatus::Ringing));
        assert!(!CallStatus::Ended.can_advance_to(CallStatus::Active));
        assert!(!CallStatus::Ended.can_advance_to(CallStatus::Ringing));
    }

    #[tokio::test]
    async fn test_initiate_rings_receiver() {
        let mut f = fixture();
        let room = f
            .calls
            .initiate("alice", "bob", CallType::Video, Some("Alice".into()), None)
            .unwrap();

        match f.bob_rx.try_recv().unwrap() {
            ServerEvent::IncomingCall {
                caller_id, room_id, ..
            } => {
                assert_eq!(caller_id, "alice");
                assert_eq!(room_id, room);
            }
            other => panic!("Unexpected event: {other:?}"),
        }

        let session = f.calls.session(&room).unwrap();
        assert_eq!(session.status, CallStatus::Ringing);
    }

    #[tokio::test]
    async fn test_initiate_offline_receiver() {
        let mut f = fixture();
        f.registry.remove_by_connection("conn-bob");

        assert!(f
            .calls
            .initiate("alice", "bob", CallType::Video, None, None)
            .is_none());
        assert_eq!(f.calls.session_count(), 0);

        // Offline notice goes to the caller only
        assert!(matches!(
            f.alice_rx.try_recv().unwrap(),
            ServerEvent::UserOffline { receiver_id } if receiver_id == "bob"
        ));
        assert!(f.bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_accept_flips_to_active() {
        let mut f = fixture();
        let room = ring(&mut f);

        f.calls.accept(&room, "bob", "alice");
        assert_eq!(f.calls.session(&room).unwrap().status, CallStatus::Active);
        assert!(matches!(
            f.alice_rx.try_recv().unwrap(),
            ServerEvent::CallAccepted { .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_accept_is_idempotent() {
        let mut f = fixture();
        let room = ring(&mut f);

        f.calls.accept(&room, "bob", "alice");
        f.calls.accept(&room, "bob", "alice");

        assert_eq!(f.calls.session(&room).unwrap().status, CallStatus::Active);
        // Notification re-sent, not errored
        assert!(f.alice_rx.try_recv().is_ok());
        assert!(f.alice_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_accept_with_unreachable_caller_still_updates() {
        let mut f = fixture();
        let room = ring(&mut f);
        f.registry.remove_by_connection("conn-alice");

        f.calls.accept(&room, "bob", "alice");
        assert_eq!(f.calls.session(&room).unwrap().status, CallStatus::Active);
    }

    #[tokio::test]
    async fn test_reject_then_accept_is_noop() {
        let mut f = fixture();
        let room = ring(&mut f);

        f.calls.reject(&room, "alice");
        assert!(matches!(
            f.alice_rx.try_recv().unwrap(),
            ServerEvent::CallRejected { .. }
        ));
        assert!(f.calls.session(&room).is_none());

        f.calls.accept(&room, "bob", "alice");
        assert!(f.calls.session(&room).is_none());
        // No acceptance delivered for a discarded session
        assert!(f.alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_end_notifies_other_party() {
        let mut f = fixture();
        let room = ring(&mut f);

        f.calls.end(&room, "bob");
        assert!(matches!(
            f.bob_rx.try_recv().unwrap(),
            ServerEvent::CallEnded { .. }
        ));
        assert!(f.calls.session(&room).is_none());
    }

    #[tokio::test]
    async fn test_signaling_pass_through() {
        let mut f = fixture();
        let room = ring(&mut f);

        f.calls.forward_offer("bob", json!({"sdp": "offer"}), &room);
        f.calls.forward_answer("alice", json!({"sdp": "answer"}), &room);
        f.calls.forward_candidate("bob", json!({"candidate": "c"}), &room);

        assert!(matches!(
            f.bob_rx.try_recv().unwrap(),
            ServerEvent::ReceiveOffer { .. }
        ));
        assert!(matches!(
            f.alice_rx.try_recv().unwrap(),
            ServerEvent::ReceiveAnswer { .. }
        ));
        assert!(matches!(
            f.bob_rx.try_recv().unwrap(),
            ServerEvent::IceCandidate { .. }
        ));

        // Pass-through never mutates session state
        assert_eq!(f.calls.session(&room).unwrap().status, CallStatus::Ringing);
    }

    #[tokio::test]
    async fn test_end_for_user_reconciles_sessions() {
        let mut f = fixture();
        let room = ring(&mut f);

        let ended = f.calls.end_for_user("alice");
        assert_eq!(ended, vec![room.clone()]);
        assert!(f.calls.session(&room).is_none());

        // Bob is told the call is over
        assert!(matches!(
            f.bob_rx.try_recv().unwrap(),
            ServerEvent::CallEnded { room_id } if room_id == room
        ));
    }

    #[tokio::test]
    async fn test_concurrent_initiations_get_distinct_rooms() {
        let mut f = fixture();
        let r1 = f
            .calls
            .initiate("alice", "bob", CallType::Audio, None, None)
            .unwrap();
        let r2 = f
            .calls
            .initiate("alice", "bob", CallType::Audio, None, None)
            .unwrap();
        assert_ne!(r1, r2);
        assert_eq!(f.calls.session_count(), 2);
    }
}
