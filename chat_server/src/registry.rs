use chat_protocol::{ServerEvent, SessionId, UserProfile};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tracing::info;
use uuid::Uuid;

use crate::error::ChatError;
use crate::fanout::RoomFanout;
use crate::outbox::Mailboxes;
use crate::presence::PresenceTracker;

/// Per-session protocol state. A session that is no longer in the registry
/// is disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registered,
    Joined,
    Disconnected,
}

/// One live connection.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub user: Option<UserProfile>,
    pub rooms: BTreeSet<String>,
}

/// Owner of all live sessions.
///
/// Lock order: the session map is taken first, then fan-out or presence,
/// then mailboxes. Neither fan-out nor presence call back into the
/// registry, so holding the session map across the cascade is safe and
/// keeps join and disconnect from interleaving.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Session>>,
    mailboxes: Arc<Mailboxes>,
    fanout: Arc<RoomFanout>,
    presence: Arc<PresenceTracker>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let mailboxes = Arc::new(Mailboxes::new());
        Self {
            sessions: Mutex::new(HashMap::new()),
            fanout: Arc::new(RoomFanout::new(mailboxes.clone())),
            presence: Arc::new(PresenceTracker::new(mailboxes.clone())),
            mailboxes,
        }
    }

    pub fn fanout(&self) -> &RoomFanout {
        &self.fanout
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn mailboxes(&self) -> &Mailboxes {
        &self.mailboxes
    }

    /// Allocate a session with no user and no rooms.
    pub fn connect(&self) -> (SessionId, Receiver<ServerEvent>) {
        let id = Uuid::new_v4();
        let mut guard = self.sessions.lock();
        guard.insert(id, Session::default());
        let rx = self.mailboxes.open(id);
        (id, rx)
    }

    /// Attach (or replace) the user of a session and announce it.
    pub fn register(&self, id: &SessionId, profile: UserProfile) -> Result<(), ChatError> {
        let mut guard = self.sessions.lock();
        let session = guard.get_mut(id).ok_or(ChatError::UnknownSession(*id))?;
        session.user = Some(profile.clone());
        self.presence.add_or_update(*id, profile);
        Ok(())
    }

    /// Add a room to the session and subscribe it. Returns false if the
    /// session was already a member.
    pub fn join(&self, id: &SessionId, room: &str) -> Result<bool, ChatError> {
        let mut guard = self.sessions.lock();
        let session = guard.get_mut(id).ok_or(ChatError::UnknownSession(*id))?;
        session.rooms.insert(room.to_string());
        Ok(self.fanout.subscribe(room, *id))
    }

    pub fn leave(&self, id: &SessionId, room: &str) -> Result<bool, ChatError> {
        let mut guard = self.sessions.lock();
        let session = guard.get_mut(id).ok_or(ChatError::UnknownSession(*id))?;
        session.rooms.remove(room);
        Ok(self.fanout.unsubscribe(room, id))
    }

    /// Tear a session down. Safe to call repeatedly and before registration.
    pub fn disconnect(&self, id: &SessionId) -> Option<Session> {
        let mut guard = self.sessions.lock();
        let session = guard.remove(id)?;
        for room in &session.rooms {
            self.fanout.unsubscribe(room, id);
        }
        self.mailboxes.close(id);
        self.presence.remove(id);
        info!(session = %id, rooms = session.rooms.len(), "session disconnected");
        Some(session)
    }

    pub fn state(&self, id: &SessionId) -> SessionState {
        match self.sessions.lock().get(id) {
            None => SessionState::Disconnected,
            Some(s) if s.user.is_none() => SessionState::Unregistered,
            Some(s) if s.rooms.is_empty() => SessionState::Registered,
            Some(_) => SessionState::Joined,
        }
    }

    pub fn profile(&self, id: &SessionId) -> Option<UserProfile> {
        self.sessions.lock().get(id).and_then(|s| s.user.clone())
    }

    pub fn rooms(&self, id: &SessionId) -> Vec<String> {
        self.sessions
            .lock()
            .get(id)
            .map(|s| s.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live connections, registered or not.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn send(&self, id: &SessionId, event: ServerEvent) -> bool {
        self.mailboxes.deliver(id, event)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Disconnects its session when dropped, so an aborted connection task
/// never leaves membership or presence behind.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: SessionId,
}

impl SessionGuard {
    pub fn new(registry: Arc<SessionRegistry>, id: SessionId) -> Self {
        Self { registry, id }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.disconnect(&self.id);
    }
}
