use chat_protocol::{PresenceEntry, ServerEvent, SessionId, UserProfile};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::outbox::Mailboxes;

/// Registered live sessions and their announced profiles.
///
/// Presence is global: changes go to every connected session, not to a room.
pub struct PresenceTracker {
    entries: Mutex<HashMap<SessionId, UserProfile>>,
    mailboxes: Arc<Mailboxes>,
}

impl PresenceTracker {
    pub fn new(mailboxes: Arc<Mailboxes>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            mailboxes,
        }
    }

    /// Insert or replace the entry for a session, then announce it.
    pub fn add_or_update(&self, session: SessionId, profile: UserProfile) {
        let count = {
            let mut guard = self.entries.lock();
            guard.insert(session, profile.clone());
            guard.len()
        };
        let entry = PresenceEntry {
            session_id: session,
            profile,
        };
        self.mailboxes
            .deliver_all(&ServerEvent::UserOnline(entry), Some(&session));
        self.mailboxes
            .deliver_all(&ServerEvent::OnlineUsersCount(count), None);
    }

    /// Remove a session. Sessions that never registered produce no
    /// offline event, only the recomputed count.
    pub fn remove(&self, session: &SessionId) -> Option<UserProfile> {
        let (removed, count) = {
            let mut guard = self.entries.lock();
            let removed = guard.remove(session);
            (removed, guard.len())
        };
        if let Some(profile) = &removed {
            let entry = PresenceEntry {
                session_id: *session,
                profile: profile.clone(),
            };
            self.mailboxes
                .deliver_all(&ServerEvent::UserOffline(entry), Some(session));
        }
        self.mailboxes
            .deliver_all(&ServerEvent::OnlineUsersCount(count), Some(session));
        removed
    }

    /// Number of registered live sessions.
    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn list(&self) -> Vec<PresenceEntry> {
        self.entries
            .lock()
            .iter()
            .map(|(id, profile)| PresenceEntry {
                session_id: *id,
                profile: profile.clone(),
            })
            .collect()
    }

    /// All sessions registered under `user_id`.
    pub fn sessions_for(&self, user_id: &str) -> Vec<SessionId> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, p)| p.user_id == user_id)
            .map(|(id, _)| *id)
            .collect()
    }
}
