use chat_protocol::{ChatMessage, User, UserProfile};
use rusqlite::{params, types::Type, OptionalExtension, Row};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::StoreError;

/// Maximum number of users returned by a directory search.
pub const SEARCH_LIMIT: usize = 10;

/// A message about to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: String,
    pub text: String,
    pub sender: String,
    pub sender_username: String,
    pub is_private: bool,
}

/// Durable message log and user directory.
///
/// Calls block; async callers go through [`blocking`].
pub trait Store: Send + Sync + 'static {
    /// Append a message to its room's log.
    fn append(&self, msg: NewMessage) -> Result<ChatMessage, StoreError>;
    /// Messages of a room in ascending creation order. With a limit only
    /// the most recent `limit` messages are returned.
    fn list_by_room(&self, room_id: &str, limit: Option<usize>)
        -> Result<Vec<ChatMessage>, StoreError>;
    fn upsert_user(&self, profile: &UserProfile) -> Result<User, StoreError>;
    fn find_user(&self, user_id: &str) -> Result<Option<User>, StoreError>;
    /// Case-insensitive substring match on username, first and last name.
    fn search_users(&self, query: &str) -> Result<Vec<User>, StoreError>;
}

pub type SharedStore = Arc<dyn Store>;

/// Run a store call on the blocking thread pool.
pub async fn blocking<T, F>(store: &SharedStore, f: F) -> Result<T, StoreError>
where
    F: FnOnce(&dyn Store) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref())).await?
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// SQLite backed [`Store`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

const MESSAGE_COLS: &str = "id, room_id, text, sender, sender_username, is_private, created_at";
const USER_COLS: &str =
    "user_id, username, first_name, last_name, email, last_active, created_at, updated_at";

fn row_to_msg(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    Ok(ChatMessage {
        id,
        room_id: row.get(1)?,
        text: row.get(2)?,
        sender: row.get(3)?,
        sender_username: row.get(4)?,
        is_private: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        user_id: row.get(0)?,
        username: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        email: row.get(4)?,
        last_active: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Case folding used for search. SQLite's `lower()` and `LIKE` only fold
/// ASCII, so names are folded here and stored next to the originals.
fn fold(s: &str) -> String {
    s.to_lowercase()
}

/// Escape LIKE wildcards so the query is matched literally.
fn like_pattern(query: &str) -> String {
    let mut out = String::with_capacity(query.len() + 2);
    out.push('%');
    for c in fold(query).chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

impl Store for SqliteStore {
    fn append(&self, msg: NewMessage) -> Result<ChatMessage, StoreError> {
        let conn = self.pool.get()?;
        let id = Uuid::new_v4();
        let now = now_millis();
        conn.execute(
            "INSERT INTO messages (id, room_id, text, sender, sender_username, is_private, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                msg.room_id,
                msg.text,
                msg.sender,
                msg.sender_username,
                msg.is_private as i64,
                now
            ],
        )?;
        Ok(ChatMessage {
            id,
            room_id: msg.room_id,
            text: msg.text,
            sender: msg.sender,
            sender_username: msg.sender_username,
            is_private: msg.is_private,
            created_at: now,
        })
    }

    fn list_by_room(
        &self,
        room_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let conn = self.pool.get()?;
        // LIMIT -1 means unbounded in SQLite
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT {MESSAGE_COLS} FROM (SELECT {MESSAGE_COLS}, rowid AS seq FROM messages WHERE room_id = ?1 ORDER BY created_at DESC, seq DESC LIMIT ?2) ORDER BY created_at ASC, seq ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let msgs = stmt
            .query_map(params![room_id, limit], row_to_msg)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(msgs)
    }

    fn upsert_user(&self, profile: &UserProfile) -> Result<User, StoreError> {
        let conn = self.pool.get()?;
        let now = now_millis();
        conn.execute(
            "INSERT INTO users (user_id, username, first_name, last_name, email, last_active, created_at, updated_at, \
             username_fold, first_name_fold, last_name_fold) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6, ?7, ?8, ?9) \
             ON CONFLICT(user_id) DO UPDATE SET username = excluded.username, first_name = excluded.first_name, \
             last_name = excluded.last_name, email = excluded.email, last_active = excluded.last_active, \
             updated_at = excluded.updated_at, username_fold = excluded.username_fold, \
             first_name_fold = excluded.first_name_fold, last_name_fold = excluded.last_name_fold",
            params![
                profile.user_id,
                profile.username,
                profile.first_name,
                profile.last_name,
                profile.email,
                now,
                fold(&profile.username),
                fold(&profile.first_name),
                fold(&profile.last_name)
            ],
        )?;
        let user = conn.query_row(
            &format!("SELECT {USER_COLS} FROM users WHERE user_id = ?1"),
            [&profile.user_id],
            row_to_user,
        )?;
        Ok(user)
    }

    fn find_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let conn = self.pool.get()?;
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE user_id = ?1"),
                [user_id],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    fn search_users(&self, query: &str) -> Result<Vec<User>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLS} FROM users \
             WHERE username_fold LIKE ?1 ESCAPE '\\' \
                OR first_name_fold LIKE ?1 ESCAPE '\\' \
                OR last_name_fold LIKE ?1 ESCAPE '\\' \
             ORDER BY username LIMIT ?2"
        ))?;
        let users = stmt
            .query_map(
                params![like_pattern(query), SEARCH_LIMIT as i64],
                row_to_user,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }
}
