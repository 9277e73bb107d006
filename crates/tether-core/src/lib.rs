//! # tether-core
//!
//! Realtime coordination primitives for the Tether server: who is online,
//! how to reach them, and the lifecycle of ephemeral call and meeting
//! sessions.
//!
//! - **ConnectionRegistry** - user identity to live connection, last-connect-wins
//! - **DirectRelay** - fire-and-forget point-to-point event forwarding
//! - **CallManager** - ringing/active/ended one-to-one call state machine
//!   plus stateless WebRTC signaling relay
//! - **ChannelMap** / **GroupChannelManager** - runtime broadcast groups
//!   for group chat routing
//! - **MeetingManager** - active/ended group meeting state machine with an
//!   append-only participant history persisted through [`SessionStore`]
//! - **DisconnectReconciler** - cleanup when a connection drops without
//!   notice
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌──────────────────┐    ┌────────────┐
//! │ Connection │───▶│ ConnectionRegistry│◀──│ CallManager │
//! └────────────┘    └──────────────────┘    └────────────┘
//!        │          ┌──────────────────┐    ┌──────────────┐
//!        └─────────▶│    ChannelMap    │◀───│MeetingManager│──▶ SessionStore
//!                   └──────────────────┘    └──────────────┘
//! ```
//!
//! All shared state is behind narrow, lock-disciplined interfaces; no
//! component holds a connection handle across time, and all
//! cross-connection communication is asynchronous notification into the
//! target connection's outbound queue.

pub mod call;
pub mod channel;
pub mod group;
pub mod ids;
pub mod meeting;
pub mod reconcile;
pub mod registry;
pub mod relay;
pub mod store;

pub use call::{CallManager, CallSession, CallStatus};
pub use channel::ChannelMap;
pub use group::GroupChannelManager;
pub use meeting::MeetingManager;
pub use reconcile::DisconnectReconciler;
pub use registry::{ConnectionEntry, ConnectionHandle, ConnectionRegistry, UserId};
pub use relay::DirectRelay;
pub use store::{
    GroupMessageRecord, GroupRecord, MeetingRecord, MeetingStatus, MemoryStore, Participant,
    ParticipantUpdate, SessionStore, StoreError,
};
