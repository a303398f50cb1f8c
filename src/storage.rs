//! SQLite store for the signed-in session.
//!
//! The platform owns every profile and message; the only thing kept locally
//! is the auth session, so a restarted server can pick up where it left off.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{AuthSession, Identity};

pub const DB_FILE_NAME: &str = "huddle.sqlite3";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Serde(serde_json::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
            StorageError::Serde(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serde(e)
    }
}

/// Database location inside a data directory.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILE_NAME)
}

pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let storage = Self {
            conn: Connection::open_in_memory()?,
        };
        storage.create_schema()?;
        Ok(storage)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        // Single-row table: `slot` is always 1.
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS session (
                slot          INTEGER PRIMARY KEY CHECK (slot = 1),
                access_token  TEXT NOT NULL,
                refresh_token TEXT,
                expires_at    INTEGER,
                identity      TEXT NOT NULL,
                saved_at      INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Store `session`, replacing any previous one.
    pub fn save_session(&self, session: &AuthSession) -> Result<(), StorageError> {
        let identity = serde_json::to_string(&session.identity)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO session
                (slot, access_token, refresh_token, expires_at, identity, saved_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)",
            params![
                session.access_token,
                session.refresh_token,
                session.expires_at,
                identity,
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn load_session(&self) -> Result<Option<AuthSession>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT access_token, refresh_token, expires_at, identity
                 FROM session WHERE slot = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((access_token, refresh_token, expires_at, identity)) = row else {
            return Ok(None);
        };
        let identity: Identity = serde_json::from_str(&identity)?;
        Ok(Some(AuthSession {
            access_token,
            refresh_token,
            expires_at,
            identity,
        }))
    }

    pub fn clear_session(&self) -> Result<(), StorageError> {
        self.conn.execute("DELETE FROM session", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(token: &str) -> AuthSession {
        AuthSession {
            access_token: token.to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(1_900_000_000),
            identity: Identity {
                id: "auth-1".to_string(),
                email: "a@example.com".to_string(),
                metadata: serde_json::json!({"username": "alice"}),
            },
        }
    }

    #[test]
    fn test_session_round_trip() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(storage.load_session().unwrap().is_none());

        storage.save_session(&session("t1")).unwrap();
        assert_eq!(storage.load_session().unwrap(), Some(session("t1")));
    }

    #[test]
    fn test_save_replaces_previous_session() {
        let storage = Storage::open_in_memory().unwrap();
        storage.save_session(&session("t1")).unwrap();
        storage.save_session(&session("t2")).unwrap();
        let loaded = storage.load_session().unwrap().unwrap();
        assert_eq!(loaded.access_token, "t2");
    }

    #[test]
    fn test_clear_session() {
        let storage = Storage::open_in_memory().unwrap();
        storage.save_session(&session("t1")).unwrap();
        storage.clear_session().unwrap();
        assert!(storage.load_session().unwrap().is_none());
        // Clearing an empty store is fine.
        storage.clear_session().unwrap();
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_path(&dir.path().join("nested"));
        {
            let storage = Storage::open(&path).unwrap();
            storage.save_session(&session("persisted")).unwrap();
        }
        let reopened = Storage::open(&path).unwrap();
        assert_eq!(
            reopened.load_session().unwrap().map(|s| s.access_token),
            Some("persisted".to_string())
        );
    }
}
