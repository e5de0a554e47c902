//! 会话：数据模型与带版本的持久化

pub mod model;
pub mod sqlite;
pub mod store;

pub use model::{Role, Session, SessionId, SessionStatus, TerminationReason, Turn, TurnContent};
pub use sqlite::SqliteSessionStore;
pub use store::{create_session_store, MemorySessionStore, SessionStore, StoreError};
