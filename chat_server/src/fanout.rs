use chat_protocol::{ServerEvent, SessionId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::outbox::Mailboxes;

/// Separator between the two participant ids of a direct room key.
pub const DIRECT_SEPARATOR: char = '-';

/// Canonical room key for a conversation between two users.
///
/// Both participants derive the same key regardless of who initiates.
/// User ids must not contain [`DIRECT_SEPARATOR`], or distinct pairs can
/// share a key.
pub fn direct_key(a: &str, b: &str) -> String {
    let (min, max) = if a <= b { (a, b) } else { (b, a) };
    format!("{min}{DIRECT_SEPARATOR}{max}")
}

/// Room membership sets and room-scoped delivery.
///
/// Rooms exist only while they have members.
pub struct RoomFanout {
    rooms: Mutex<HashMap<String, HashSet<SessionId>>>,
    mailboxes: Arc<Mailboxes>,
}

impl RoomFanout {
    pub fn new(mailboxes: Arc<Mailboxes>) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            mailboxes,
        }
    }

    /// Returns true if the session was not yet a member.
    pub fn subscribe(&self, room: &str, session: SessionId) -> bool {
        self.rooms
            .lock()
            .entry(room.to_string())
            .or_default()
            .insert(session)
    }

    /// Returns true if the session was a member.
    pub fn unsubscribe(&self, room: &str, session: &SessionId) -> bool {
        let mut guard = self.rooms.lock();
        let Some(members) = guard.get_mut(room) else {
            return false;
        };
        let removed = members.remove(session);
        if members.is_empty() {
            guard.remove(room);
        }
        removed
    }

    pub fn members(&self, room: &str) -> Vec<SessionId> {
        self.rooms
            .lock()
            .get(room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.lock().get(room).map_or(0, HashSet::len)
    }

    /// Number of rooms that currently have members.
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    /// Deliver `event` to every current member of `room` except `exclude`.
    ///
    /// Membership is snapshotted at call time; later joins do not receive it.
    pub fn broadcast(&self, room: &str, event: &ServerEvent, exclude: Option<&SessionId>) -> usize {
        let targets: Vec<SessionId> = {
            let guard = self.rooms.lock();
            match guard.get(room) {
                Some(members) => members
                    .iter()
                    .filter(|id| Some(*id) != exclude)
                    .copied()
                    .collect(),
                None => return 0,
            }
        };
        let delivered = self.mailboxes.deliver_many(&targets, event);
        debug!(room, event = event.name(), delivered, "room broadcast");
        delivered
    }
}
