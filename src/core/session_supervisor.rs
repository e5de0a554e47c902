//! 会话监管：单会话独占与取消
//!
//! 每个 session id 同一时刻只允许一个循环在执行（begin 返回租约，drop 时释放）；
//! 租约持有该会话的 CancellationToken，cancel(session_id) 会中断其所有在途的模型 / 工具调用。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

type LeaseTable = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// 会话级生命周期管理：在途会话表 + 全局关闭令牌
#[derive(Debug)]
pub struct SessionSupervisor {
    leases: LeaseTable,
    root: CancellationToken,
}

/// 会话独占租约；drop 时从在途表中移除
#[derive(Debug)]
pub struct SessionLease {
    session_id: String,
    token: CancellationToken,
    leases: LeaseTable,
}

impl SessionLease {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Ok(mut table) = self.leases.lock() {
            table.remove(&self.session_id);
        }
    }
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            root: CancellationToken::new(),
        }
    }

    /// 占用会话；已有在途循环时返回 SessionBusy
    pub fn begin(&self, session_id: &str) -> Result<SessionLease, AgentError> {
        let mut table = self
            .leases
            .lock()
            .map_err(|_| AgentError::Store("session lease table poisoned".to_string()))?;
        if table.contains_key(session_id) {
            return Err(AgentError::SessionBusy(session_id.to_string()));
        }
        let token = self.root.child_token();
        table.insert(session_id.to_string(), token.clone());
        Ok(SessionLease {
            session_id: session_id.to_string(),
            token,
            leases: self.leases.clone(),
        })
    }

    /// 取消该会话的在途循环；没有在途循环时返回 false
    pub fn cancel(&self, session_id: &str) -> bool {
        let token = self
            .leases
            .lock()
            .ok()
            .and_then(|t| t.get(session_id).cloned());
        match token {
            Some(t) => {
                tracing::info!(session_id, "cancelling in-flight session");
                t.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.leases
            .lock()
            .map(|t| t.contains_key(session_id))
            .unwrap_or(false)
    }

    /// 进程关闭：取消全部在途会话
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
