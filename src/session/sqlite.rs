//! SQLite 会话存储（rusqlite，同步连接放在 spawn_blocking 中）
//!
//! 会话整体序列化为 JSON 存一行；版本号列用于乐观并发控制：
//! `UPDATE ... WHERE id = ? AND version = ?` 未命中即视为冲突。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::session::{Session, SessionStore, StoreError};

pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

fn backend<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl SqliteSessionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(backend)?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(backend)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(backend)?
    }
}

fn current_version(conn: &Connection, id: &str) -> Result<u64, StoreError> {
    let v: Option<i64> = conn
        .query_row("SELECT version FROM sessions WHERE id = ?1", params![id], |row| row.get(0))
        .optional()
        .map_err(backend)?;
    Ok(v.unwrap_or(0) as u64)
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<(Session, u64)>, StoreError> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT data, version FROM sessions WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(backend)?;
            match row {
                None => Ok(None),
                Some((data, version)) => {
                    let session: Session = serde_json::from_str(&data).map_err(backend)?;
                    Ok(Some((session, version as u64)))
                }
            }
        })
        .await
    }

    async fn save(&self, session: &Session, expected_version: u64) -> Result<u64, StoreError> {
        let data = serde_json::to_string(session).map_err(backend)?;
        let id = session.id.clone();
        let updated_at = session.updated_at.to_rfc3339();
        let next = expected_version + 1;
        self.with_conn(move |conn| {
            let changed = if expected_version == 0 {
                conn.execute(
                    "INSERT OR IGNORE INTO sessions (id, version, data, updated_at) VALUES (?1, ?2, ?3, ?4)",
                    params![id, next as i64, data, updated_at],
                )
            } else {
                conn.execute(
                    "UPDATE sessions SET version = ?1, data = ?2, updated_at = ?3 WHERE id = ?4 AND version = ?5",
                    params![next as i64, data, updated_at, id, expected_version as i64],
                )
            }
            .map_err(backend)?;
            if changed == 0 {
                return Err(StoreError::VersionConflict {
                    found: current_version(conn, &id)?,
                    session_id: id,
                    expected: expected_version,
                });
            }
            Ok(next)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{TerminationReason, Turn};

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteSessionStore::open(dir.path().join("sessions.db")).unwrap();

        let mut session = Session::new("s1").with_attribute("k", "v");
        session.push(Turn::user("hello"));
        let v1 = store.save(&session, 0).await.unwrap();
        assert_eq!(v1, 1);

        session.push(Turn::assistant("hi"));
        let v2 = store.save(&session, v1).await.unwrap();
        assert_eq!(v2, 2);

        let err = store.save(&session, v1).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { found: 2, .. }));

        let (loaded, version) = store.load("s1").await.unwrap().unwrap();
        assert_eq!(version, 2);
        assert_eq!(loaded.turns().len(), 2);
        assert_eq!(loaded.attributes.get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.db");
        {
            let store = SqliteSessionStore::open(&path).unwrap();
            let mut session = Session::new("persisted");
            session.terminate(TerminationReason::EndSignal);
            store.save(&session, 0).await.unwrap();
        }
        let store = SqliteSessionStore::open(&path).unwrap();
        let (loaded, _) = store.load("persisted").await.unwrap().unwrap();
        assert!(loaded.is_terminated());
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_duplicate_create_conflicts() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store.save(&Session::new("a"), 0).await.unwrap();
        assert!(matches!(
            store.save(&Session::new("a"), 0).await,
            Err(StoreError::VersionConflict { expected: 0, found: 1, .. })
        ));
    }
}
