//! Point-to-point event relay.
//!
//! Forwards chat messages, typing indicators, and read-state events from a
//! sender to the receiver's live connection. Fire-and-forget: an offline
//! receiver means the event is silently dropped, never queued and never an
//! error back to the sender. Durable delivery, if wanted, belongs to the
//! data store and happens independently of this path.

use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use tether_protocol::ServerEvent;
use tracing::trace;

/// Relay for direct (one-to-one) events.
#[derive(Debug, Clone)]
pub struct DirectRelay {
    registry: Arc<ConnectionRegistry>,
}

impl DirectRelay {
    /// Create a relay over the given registry.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Forward an event to a receiver, dropping it silently if offline.
    ///
    /// Returns `true` only if the receiver was reachable.
    pub fn relay(&self, receiver_id: &str, event: ServerEvent) -> bool {
        let delivered = self.registry.send_to(receiver_id, event);
        trace!(receiver = %receiver_id, delivered, "Direct relay");
        delivered
    }

    /// Deliver a chat message, marked unread.
    pub fn deliver_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        message: serde_json::Value,
        timestamp: serde_json::Value,
    ) -> bool {
        self.relay(
            receiver_id,
            ServerEvent::ReceiveMessage {
                sender_id: sender_id.to_string(),
                message,
                timestamp,
                read: false,
            },
        )
    }

    /// Deliver a typing indicator.
    pub fn deliver_typing(&self, sender_id: &str, receiver_id: &str) -> bool {
        self.relay(
            receiver_id,
            ServerEvent::UserTyping {
                user_id: sender_id.to_string(),
            },
        )
    }

    /// Deliver a stop-typing indicator.
    pub fn deliver_stop_typing(&self, sender_id: &str, receiver_id: &str) -> bool {
        self.relay(
            receiver_id,
            ServerEvent::UserStopTyping {
                user_id: sender_id.to_string(),
            },
        )
    }
}
