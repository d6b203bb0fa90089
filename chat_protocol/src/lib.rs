use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of one live connection.
pub type SessionId = Uuid;

/// Names of the events a client may send.
pub mod events {
    pub const REGISTER_USER: &str = "register_user";
    pub const JOIN_ROOM: &str = "join_room";
    pub const LEAVE_ROOM: &str = "leave_room";
    pub const SEND_MESSAGE: &str = "send_message";
    pub const DIRECT_MESSAGE: &str = "direct_message";
    pub const TYPING: &str = "typing";
    pub const STOP_TYPING: &str = "stop_typing";
}

/// Envelope of every inbound text frame: `{"event": "...", "data": ...}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new<T: Serialize>(event: &str, data: &T) -> serde_json::Result<Self> {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_value(data)?,
        })
    }
}

/// Profile handed over by the identity provider.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// `register_user` payload. Every field is optional on the wire.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUser {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl From<RegisterUser> for UserProfile {
    fn from(r: RegisterUser) -> Self {
        Self {
            user_id: r.user_id.unwrap_or_default(),
            username: r.username.unwrap_or_default(),
            first_name: r.first_name.unwrap_or_default(),
            last_name: r.last_name.unwrap_or_default(),
            email: r.email.filter(|e| !e.is_empty()),
        }
    }
}

/// Room reference used by `join_room` and `leave_room`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomTarget {
    #[serde(alias = "roomKey")]
    pub room_id: String,
    /// Accepted for private rooms but never checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// `join_room` accepts either a bare room key or a [`RoomTarget`] object.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum JoinRoom {
    Key(String),
    Target(RoomTarget),
}

impl JoinRoom {
    pub fn into_target(self) -> RoomTarget {
        match self {
            JoinRoom::Key(room_id) => RoomTarget {
                room_id,
                password: None,
            },
            JoinRoom::Target(t) => t,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub room_id: String,
    pub text: String,
    pub sender: String,
    pub sender_username: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub recipient_id: String,
    pub text: String,
    pub sender: String,
    pub sender_username: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub room_id: String,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StopTyping {
    pub room_id: String,
}

/// A stored chat message. Immutable once persisted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: String,
    pub text: String,
    pub sender: String,
    pub sender_username: String,
    pub is_private: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

/// A user record in the directory.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub last_active: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One registered live session and the profile it announced.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub profile: UserProfile,
}

/// Events pushed from the server to a session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Connected { session_id: SessionId },
    PreviousMessages(Vec<ChatMessage>),
    ReceiveMessage(ChatMessage),
    PrivateMessage(ChatMessage),
    UserTyping { username: String },
    UserStopTyping,
    UserOnline(PresenceEntry),
    UserOffline(PresenceEntry),
    OnlineUsersCount(usize),
    /// Rejection of an inbound event, sent to the originator only.
    Error { event: String, reason: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::PreviousMessages(_) => "previous_messages",
            ServerEvent::ReceiveMessage(_) => "receive_message",
            ServerEvent::PrivateMessage(_) => "private_message",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::UserStopTyping => "user_stop_typing",
            ServerEvent::UserOnline(_) => "user_online",
            ServerEvent::UserOffline(_) => "user_offline",
            ServerEvent::OnlineUsersCount(_) => "online_users_count",
            ServerEvent::Error { .. } => "error",
        }
    }
}
