use chat_protocol::{
    events, DirectMessage, Frame, JoinRoom, RegisterUser, RoomTarget, SendMessage, ServerEvent,
    SessionId, StopTyping, Typing, UserProfile,
};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info, warn};

use crate::error::ChatError;
use crate::fanout::direct_key;
use crate::registry::{SessionGuard, SessionRegistry, SessionState};
use crate::store::{self, NewMessage, SharedStore};

/// Number of messages replayed to a session when it joins a room.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

type HandlerFuture<'a> = BoxFuture<'a, Result<(), ChatError>>;
type HandlerFn = for<'a> fn(&'a ChatHub, SessionId, Value) -> HandlerFuture<'a>;

static DISPATCH: Lazy<HashMap<&'static str, HandlerFn>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, HandlerFn> = HashMap::new();
    table.insert(events::REGISTER_USER, register_user);
    table.insert(events::JOIN_ROOM, join_room);
    table.insert(events::LEAVE_ROOM, leave_room);
    table.insert(events::SEND_MESSAGE, send_message);
    table.insert(events::DIRECT_MESSAGE, direct_message);
    table.insert(events::TYPING, typing);
    table.insert(events::STOP_TYPING, stop_typing);
    table
});

fn register_user(hub: &ChatHub, id: SessionId, data: Value) -> HandlerFuture<'_> {
    Box::pin(hub.on_register(id, data))
}

fn join_room(hub: &ChatHub, id: SessionId, data: Value) -> HandlerFuture<'_> {
    Box::pin(hub.on_join(id, data))
}

fn leave_room(hub: &ChatHub, id: SessionId, data: Value) -> HandlerFuture<'_> {
    Box::pin(hub.on_leave(id, data))
}

fn send_message(hub: &ChatHub, id: SessionId, data: Value) -> HandlerFuture<'_> {
    Box::pin(hub.on_send(id, data))
}

fn direct_message(hub: &ChatHub, id: SessionId, data: Value) -> HandlerFuture<'_> {
    Box::pin(hub.on_direct(id, data))
}

fn typing(hub: &ChatHub, id: SessionId, data: Value) -> HandlerFuture<'_> {
    Box::pin(hub.on_typing(id, data))
}

fn stop_typing(hub: &ChatHub, id: SessionId, data: Value) -> HandlerFuture<'_> {
    Box::pin(hub.on_stop_typing(id, data))
}

fn payload<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, ChatError> {
    serde_json::from_value(data).map_err(|e| {
        debug!(event, error = %e, "payload rejected");
        ChatError::validation(event, "invalid_payload")
    })
}

fn require(event: &str, field: &str, value: &str) -> Result<(), ChatError> {
    if value.trim().is_empty() {
        return Err(ChatError::validation(event, format!("missing_{field}")));
    }
    Ok(())
}

/// Interprets inbound events for every session and produces outbound ones.
#[derive(Clone)]
pub struct ChatHub {
    registry: Arc<SessionRegistry>,
    store: SharedStore,
    history_limit: usize,
}

impl ChatHub {
    pub fn new(store: SharedStore, history_limit: usize) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            store,
            history_limit,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Open a session. Dropping the guard disconnects it.
    pub fn connect(&self) -> (SessionGuard, Receiver<ServerEvent>) {
        let (id, rx) = self.registry.connect();
        self.registry.send(&id, ServerEvent::Connected { session_id: id });
        self.registry.send(
            &id,
            ServerEvent::OnlineUsersCount(self.registry.presence().count()),
        );
        info!(session = %id, "session connected");
        (SessionGuard::new(self.registry.clone(), id), rx)
    }

    /// Handle one raw text frame from a session.
    pub async fn handle_text(&self, id: SessionId, text: &str) {
        match serde_json::from_str::<Frame>(text) {
            Ok(frame) => self.dispatch(id, frame).await,
            Err(e) => {
                warn!(session = %id, error = %e, "dropping malformed frame");
                self.registry.send(
                    &id,
                    ServerEvent::Error {
                        event: String::new(),
                        reason: "malformed_frame".into(),
                    },
                );
            }
        }
    }

    pub async fn dispatch(&self, id: SessionId, frame: Frame) {
        let Some(handler) = DISPATCH.get(frame.event.as_str()) else {
            warn!(session = %id, event = %frame.event, "dropping unknown event");
            self.reject(id, &frame.event, "unknown_event".into());
            return;
        };
        if let Err(e) = handler(self, id, frame.data).await {
            self.report(id, &frame.event, e);
        }
    }

    fn report(&self, id: SessionId, event: &str, err: ChatError) {
        match &err {
            ChatError::UnknownSession(_) => {
                debug!(session = %id, event, "event for a gone session ignored");
                return;
            }
            ChatError::Persistence(e) => error!(session = %id, event, error = %e, "store failure"),
            ChatError::Validation { .. } | ChatError::NotRegistered => {
                warn!(session = %id, event, error = %err, "event rejected")
            }
        }
        self.reject(id, event, err.reason());
    }

    fn reject(&self, id: SessionId, event: &str, reason: String) {
        self.registry.send(
            &id,
            ServerEvent::Error {
                event: event.into(),
                reason,
            },
        );
    }

    async fn on_register(&self, id: SessionId, data: Value) -> Result<(), ChatError> {
        // a null payload still registers, with an empty profile
        let req: RegisterUser = if data.is_null() {
            RegisterUser::default()
        } else {
            payload(events::REGISTER_USER, data)?
        };
        let profile = UserProfile::from(req);
        self.registry.register(&id, profile.clone())?;
        info!(session = %id, user = %profile.user_id, username = %profile.username, "user registered");
        if !profile.user_id.is_empty() {
            let store = self.store.clone();
            tokio::spawn(async move {
                let user_id = profile.user_id.clone();
                if let Err(e) = store::blocking(&store, move |s| s.upsert_user(&profile)).await {
                    error!(user = %user_id, error = %e, "failed to upsert user");
                }
            });
        }
        Ok(())
    }

    async fn on_join(&self, id: SessionId, data: Value) -> Result<(), ChatError> {
        let RoomTarget { room_id, password } =
            payload::<JoinRoom>(events::JOIN_ROOM, data)?.into_target();
        require(events::JOIN_ROOM, "room_id", &room_id)?;
        match self.registry.state(&id) {
            SessionState::Unregistered => return Err(ChatError::NotRegistered),
            SessionState::Disconnected => return Err(ChatError::UnknownSession(id)),
            SessionState::Registered | SessionState::Joined => {}
        }
        if password.is_some() {
            debug!(session = %id, room = %room_id, "room password accepted unchecked");
        }
        self.registry.join(&id, &room_id)?;
        info!(session = %id, room = %room_id, "joined room");
        let limit = self.history_limit;
        let room = room_id.clone();
        let history = store::blocking(&self.store, move |s| s.list_by_room(&room, Some(limit))).await?;
        debug!(session = %id, room = %room_id, count = history.len(), "sending history");
        self.registry.send(&id, ServerEvent::PreviousMessages(history));
        Ok(())
    }

    async fn on_leave(&self, id: SessionId, data: Value) -> Result<(), ChatError> {
        let target = payload::<JoinRoom>(events::LEAVE_ROOM, data)?.into_target();
        require(events::LEAVE_ROOM, "room_id", &target.room_id)?;
        self.registry.leave(&id, &target.room_id)?;
        Ok(())
    }

    async fn on_send(&self, id: SessionId, data: Value) -> Result<(), ChatError> {
        let req: SendMessage = payload(events::SEND_MESSAGE, data)?;
        require(events::SEND_MESSAGE, "room_id", &req.room_id)?;
        require(events::SEND_MESSAGE, "text", &req.text)?;
        require(events::SEND_MESSAGE, "sender", &req.sender)?;
        let msg = NewMessage {
            room_id: req.room_id,
            text: req.text,
            sender: req.sender,
            sender_username: req.sender_username,
            is_private: false,
        };
        let stored = store::blocking(&self.store, move |s| s.append(msg)).await?;
        let room = stored.room_id.clone();
        let delivered = self
            .registry
            .fanout()
            .broadcast(&room, &ServerEvent::ReceiveMessage(stored), None);
        debug!(session = %id, room = %room, delivered, "room message");
        Ok(())
    }

    async fn on_direct(&self, id: SessionId, data: Value) -> Result<(), ChatError> {
        let req: DirectMessage = payload(events::DIRECT_MESSAGE, data)?;
        require(events::DIRECT_MESSAGE, "recipient_id", &req.recipient_id)?;
        require(events::DIRECT_MESSAGE, "text", &req.text)?;
        require(events::DIRECT_MESSAGE, "sender", &req.sender)?;
        let msg = NewMessage {
            room_id: direct_key(&req.sender, &req.recipient_id),
            text: req.text,
            sender: req.sender,
            sender_username: req.sender_username,
            is_private: true,
        };
        let stored = store::blocking(&self.store, move |s| s.append(msg)).await?;
        let recipients: Vec<SessionId> = self
            .registry
            .presence()
            .sessions_for(&req.recipient_id)
            .into_iter()
            .filter(|s| *s != id)
            .collect();
        let delivered = self
            .registry
            .mailboxes()
            .deliver_many(&recipients, &ServerEvent::PrivateMessage(stored.clone()));
        debug!(session = %id, room = %stored.room_id, delivered, "direct message");
        self.registry.send(&id, ServerEvent::PrivateMessage(stored));
        Ok(())
    }

    async fn on_typing(&self, id: SessionId, data: Value) -> Result<(), ChatError> {
        let req: Typing = payload(events::TYPING, data)?;
        require(events::TYPING, "room_id", &req.room_id)?;
        self.registry.fanout().broadcast(
            &req.room_id,
            &ServerEvent::UserTyping {
                username: req.username,
            },
            Some(&id),
        );
        Ok(())
    }

    async fn on_stop_typing(&self, id: SessionId, data: Value) -> Result<(), ChatError> {
        let req: StopTyping = payload(events::STOP_TYPING, data)?;
        require(events::STOP_TYPING, "room_id", &req.room_id)?;
        self.registry
            .fanout()
            .broadcast(&req.room_id, &ServerEvent::UserStopTyping, Some(&id));
        Ok(())
    }
}
