//! 监督层：智能体描述、按能力路由委派、敏感动作的人工审批

pub mod approval;
pub mod descriptor;
pub mod router;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use approval::{
    ApprovalChannel, ApprovalDecision, ApprovalRequest, InMemoryApprovalChannel, PendingApproval,
};
pub use descriptor::{load_agents, parse_agents, AgentDescriptor};
pub use router::CapabilityRouter;

/// 模型发出的委派意图（`delegate` 调用的参数）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRequest {
    pub task: String,
    /// 子智能体要执行的动作名（用于审批判断）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// 指定目标智能体，跳过能力匹配
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl DelegationRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            action: None,
            capabilities: Vec::new(),
            agent_id: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// 从已通过 schema 校验的 `delegate` 参数解析
    pub fn from_args(args: &Value) -> Result<Self, String> {
        serde_json::from_value(args.clone()).map_err(|e| format!("invalid delegation arguments: {e}"))
    }
}
