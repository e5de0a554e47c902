//! 人工审批：请求、决定与审批通道
//!
//! 循环在需审批的动作前挂起：先把 PendingApproval 写入会话并持久化，再通过通道 emit 请求；
//! 决定可能在任意延迟之后到达，由外部调用 resume 恢复。

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::core::AgentError;
use crate::tools::ToolCallRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// 与被挂起的工具调用 / 委派调用相同
    pub correlation_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub action: String,
    pub description: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub correlation_id: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl ApprovalDecision {
    pub fn approve(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            approved: true,
            rationale: None,
        }
    }

    pub fn deny(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            approved: false,
            rationale: None,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

/// 会话中挂起的审批：请求本身 + 待执行的调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    pub call: ToolCallRequest,
}

#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn emit(&self, request: ApprovalRequest) -> Result<(), AgentError>;

    /// 等待某个请求的决定
    async fn wait_decision(&self, correlation_id: &str) -> Result<ApprovalDecision, AgentError>;
}

/// 进程内审批通道：决定由 decide 从外部写入
#[derive(Debug, Default)]
pub struct InMemoryApprovalChannel {
    requests: Mutex<Vec<ApprovalRequest>>,
    decisions: Mutex<HashMap<String, ApprovalDecision>>,
    notify: Notify,
}

impl InMemoryApprovalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尚未决定的请求（按 emit 顺序）
    pub fn pending_requests(&self) -> Vec<ApprovalRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn decide(&self, decision: ApprovalDecision) -> Result<(), AgentError> {
        let mut requests = self
            .requests
            .lock()
            .map_err(|_| AgentError::Store("approval table poisoned".to_string()))?;
        let Some(pos) = requests
            .iter()
            .position(|r| r.correlation_id == decision.correlation_id)
        else {
            return Err(AgentError::NoPendingApproval(decision.correlation_id));
        };
        requests.remove(pos);
        drop(requests);
        tracing::info!(
            correlation_id = %decision.correlation_id,
            approved = decision.approved,
            "approval decided"
        );
        if let Ok(mut d) = self.decisions.lock() {
            d.insert(decision.correlation_id.clone(), decision);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn take_decision(&self, correlation_id: &str) -> Option<ApprovalDecision> {
        self.decisions.lock().ok()?.remove(correlation_id)
    }
}

#[async_trait]
impl ApprovalChannel for InMemoryApprovalChannel {
    async fn emit(&self, request: ApprovalRequest) -> Result<(), AgentError> {
        tracing::info!(
            correlation_id = %request.correlation_id,
            session_id = %request.session_id,
            action = %request.action,
            "approval requested"
        );
        let mut requests = self
            .requests
            .lock()
            .map_err(|_| AgentError::Store("approval table poisoned".to_string()))?;
        if !requests.iter().any(|r| r.correlation_id == request.correlation_id) {
            requests.push(request);
        }
        Ok(())
    }

    async fn wait_decision(&self, correlation_id: &str) -> Result<ApprovalDecision, AgentError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(decision) = self.take_decision(correlation_id) {
                return Ok(decision);
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(id: &str) -> ApprovalRequest {
        ApprovalRequest {
            correlation_id: id.to_string(),
            session_id: "s1".to_string(),
            agent_id: Some("reservations".to_string()),
            action: "cancel_booking".to_string(),
            description: "cancel booking ABC123".to_string(),
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_decision_arrives_after_delay() {
        let channel = Arc::new(InMemoryApprovalChannel::new());
        channel.emit(request("c1")).await.unwrap();
        assert_eq!(channel.pending_requests().len(), 1);

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.wait_decision("c1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel
            .decide(ApprovalDecision::deny("c1").with_rationale("not allowed"))
            .unwrap();

        let decision = waiter.await.unwrap().unwrap();
        assert!(!decision.approved);
        assert_eq!(decision.rationale.as_deref(), Some("not allowed"));
        assert!(channel.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_decision_before_wait_is_kept() {
        let channel = InMemoryApprovalChannel::new();
        channel.emit(request("c2")).await.unwrap();
        channel.decide(ApprovalDecision::approve("c2")).unwrap();
        assert!(channel.wait_decision("c2").await.unwrap().approved);
    }

    #[test]
    fn test_decide_unknown_request() {
        let channel = InMemoryApprovalChannel::new();
        assert!(matches!(
            channel.decide(ApprovalDecision::approve("nope")),
            Err(AgentError::NoPendingApproval(_))
        ));
    }
}
