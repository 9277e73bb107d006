//! # tether-protocol
//!
//! Wire protocol definitions for the Tether realtime coordination server.
//!
//! This crate defines the JSON event catalog exchanged over a persistent
//! bidirectional connection, split into inbound [`ClientEvent`]s and
//! outbound [`ServerEvent`]s, plus the text-frame codec.
//!
//! ## Event namespaces
//!
//! - Presence: `user-online` / `user-status`
//! - Direct relay: `send-message`, typing indicators
//! - Call signaling: `initiate-call` through `end-call`, offer/answer/ICE
//! - Groups: `join-group`, `leave-group`, `group-message`
//! - Meetings: `start-group-meeting` through `end-group-meeting`
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{codec, ClientEvent};
//!
//! let frame = r#"{"event":"user-online","data":{"userId":"alice"}}"#;
//! let event = codec::decode(frame).unwrap();
//! assert!(matches!(event, ClientEvent::UserOnline { .. }));
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, encode, ProtocolError};
pub use events::{CallType, ClientEvent, PresenceStatus, ServerEvent};
