//! 会话存储契约与内存实现
//!
//! load 返回会话与版本号；save 带期望版本（新会话为 0），版本不一致返回 VersionConflict，
//! 由调用方重试整个步骤。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::SessionSection;
use crate::core::AgentError;
use crate::session::{Session, SqliteSessionStore};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("version conflict on {session_id}: expected {expected}, found {found}")]
    VersionConflict {
        session_id: String,
        expected: u64,
        found: u64,
    },
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for AgentError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionConflict {
                session_id,
                expected,
                found,
            } => AgentError::VersionConflict {
                session_id,
                expected,
                found,
            },
            StoreError::NotFound(id) => AgentError::SessionNotFound(id),
            StoreError::Backend(msg) => AgentError::Store(msg),
        }
    }
}

/// 会话存储：乐观版本控制
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 不存在时返回 None
    async fn load(&self, session_id: &str) -> Result<Option<(Session, u64)>, StoreError>;

    /// 成功返回新版本号；expected_version 为 0 表示首次保存
    async fn save(&self, session: &Session, expected_version: u64) -> Result<u64, StoreError>;
}

/// 进程内会话存储（测试与默认配置）
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, (Session, u64)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<(Session, u64)>, StoreError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn save(&self, session: &Session, expected_version: u64) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write().await;
        let found = sessions.get(&session.id).map(|(_, v)| *v).unwrap_or(0);
        if found != expected_version {
            return Err(StoreError::VersionConflict {
                session_id: session.id.clone(),
                expected: expected_version,
                found,
            });
        }
        let next = found + 1;
        sessions.insert(session.id.clone(), (session.clone(), next));
        Ok(next)
    }
}

/// 按 [session] 配置创建存储后端
pub fn create_session_store(cfg: &SessionSection) -> Result<Arc<dyn SessionStore>, AgentError> {
    match cfg.backend.as_str() {
        "memory" => Ok(Arc::new(MemorySessionStore::new())),
        "sqlite" => {
            let store = SqliteSessionStore::open(&cfg.db_path)?;
            tracing::info!(path = %cfg.db_path.display(), "sqlite session store opened");
            Ok(Arc::new(store))
        }
        other => Err(AgentError::Config(format!(
            "unknown session backend `{other}` (expected memory or sqlite)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Turn;

    #[tokio::test]
    async fn test_save_with_stale_version_conflicts() {
        let store = MemorySessionStore::new();
        let mut session = Session::new("s1");
        assert!(store.load("s1").await.unwrap().is_none());

        let v1 = store.save(&session, 0).await.unwrap();
        assert_eq!(v1, 1);

        session.push(Turn::user("hi"));
        let v2 = store.save(&session, v1).await.unwrap();
        assert_eq!(v2, 2);

        let err = store.save(&session, v1).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                session_id: "s1".to_string(),
                expected: 1,
                found: 2
            }
        );

        let (loaded, version) = store.load("s1").await.unwrap().unwrap();
        assert_eq!(version, 2);
        assert_eq!(loaded.turns().len(), 1);
    }

    #[tokio::test]
    async fn test_second_create_conflicts() {
        let store = MemorySessionStore::new();
        store.save(&Session::new("dup"), 0).await.unwrap();
        assert!(matches!(
            store.save(&Session::new("dup"), 0).await,
            Err(StoreError::VersionConflict { found: 1, .. })
        ));
    }

    #[test]
    fn test_store_error_maps_to_agent_error() {
        let e: AgentError = StoreError::NotFound("x".into()).into();
        assert!(matches!(e, AgentError::SessionNotFound(_)));
    }
}
