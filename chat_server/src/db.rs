use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;

use crate::error::StoreError;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Open a pooled SQLite database and apply the schema.
///
/// `:memory:` yields a single-connection pool so every checkout sees the
/// same database.
pub fn open_pool<P: AsRef<Path>>(path: P) -> Result<DbPool, StoreError> {
    let path = path.as_ref();
    let pool = if path == Path::new(":memory:") {
        Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?
    } else {
        let manager = SqliteConnectionManager::file(path).with_init(|c| {
            c.pragma_update(None, "journal_mode", "WAL")?;
            c.busy_timeout(Duration::from_secs(5))
        });
        Pool::new(manager)?
    };
    pool.get()?.execute_batch(SCHEMA)?;
    Ok(pool)
}

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  username TEXT NOT NULL DEFAULT '',
  first_name TEXT NOT NULL DEFAULT '',
  last_name TEXT NOT NULL DEFAULT '',
  email TEXT,
  last_active INTEGER NOT NULL,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  username_fold TEXT NOT NULL DEFAULT '',
  first_name_fold TEXT NOT NULL DEFAULT '',
  last_name_fold TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS messages (
  id TEXT PRIMARY KEY,
  room_id TEXT NOT NULL,
  text TEXT NOT NULL,
  sender TEXT NOT NULL,
  sender_username TEXT NOT NULL,
  is_private INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS messages_room_created ON messages(room_id, created_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pool_shares_schema() {
        let pool = open_pool(":memory:").unwrap();
        let n: i64 = pool
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn file_pool_is_reopenable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("chat.db");
        open_pool(&path).unwrap();
        assert!(open_pool(&path).is_ok());
    }
}
