//! Identifier and timestamp generation.
//!
//! Room and record ids combine a millisecond timestamp with a process-wide
//! atomic counter so that concurrent generation within the same millisecond
//! still yields distinct ids.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Atomic counter for ensuring unique ids even within the same millisecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Generate a room id for a one-to-one call.
///
/// The id embeds both party ids so a session is traceable in logs, and a
/// timestamp + counter suffix so concurrent calls between the same pair
/// never collide.
#[must_use]
pub fn generate_room_id(caller_id: &str, receiver_id: &str) -> String {
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{caller_id}-{receiver_id}-{}-{seq}", now_millis())
}

/// Generate an opaque record id.
#[must_use]
pub fn generate_record_id() -> String {
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{seq:x}", now_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_ids_unique_within_same_millisecond() {
        let a = generate_room_id("alice", "bob");
        let b = generate_room_id("alice", "bob");
        assert_ne!(a, b);
    }

    #[test]
    fn test_room_id_embeds_parties() {
        let id = generate_room_id("alice", "bob");
        assert!(id.starts_with("alice-bob-"));
    }

    #[test]
    fn test_record_ids_unique() {
        let a = generate_record_id();
        let b = generate_record_id();
        assert_ne!(a, b);
    }
}
