//! 会话数据模型：Session / Turn
//!
//! 会话由唯一的在途循环独占修改，在步骤边界持久化；turn 历史只追加，时间戳单调不减。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::supervisor::PendingApproval;
use crate::tools::{ToolCallRequest, ToolResult};

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 一条 turn 的内容：文本、结构化工具调用或工具结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnContent {
    Text { text: String },
    ToolCall { call: ToolCallRequest },
    ToolResult { result: ToolResult },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self::now(Role::User, TurnContent::Text { text: text.into() })
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::now(Role::Assistant, TurnContent::Text { text: text.into() })
    }

    pub fn tool_call(call: ToolCallRequest) -> Self {
        Self::now(Role::Assistant, TurnContent::ToolCall { call })
    }

    pub fn tool_result(result: ToolResult) -> Self {
        Self::now(Role::Tool, TurnContent::ToolResult { result })
    }

    fn now(role: Role, content: TurnContent) -> Self {
        Self {
            role,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCallRequest> {
        match &self.content {
            TurnContent::ToolCall { call } => Some(call),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResult> {
        match &self.content {
            TurnContent::ToolResult { result } => Some(result),
            _ => None,
        }
    }

    /// 渲染给模型看的消息正文：工具调用按协议格式回放，结果带 correlation id
    pub fn render(&self) -> String {
        match &self.content {
            TurnContent::Text { text } => text.clone(),
            TurnContent::ToolCall { call } => serde_json::json!({
                "tool": call.tool,
                "args": call.args,
                "id": call.id,
            })
            .to_string(),
            TurnContent::ToolResult { result } => format!(
                "[tool_result id={} tool={} ok={}] {}",
                result.correlation_id,
                result.tool,
                result.success,
                result.render()
            ),
        }
    }
}

/// 会话终止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// 调用方或模型发出结束信号
    EndSignal,
    StepBudgetExceeded,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    /// 已发出审批请求，等待外部决定
    AwaitingApproval,
    Terminated { reason: TerminationReason },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// 子会话（委派给子智能体时）的父会话
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    turns: Vec<Turn>,
    /// 调用方提供的上下文属性
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub status: SessionStatus,
    /// 累计已执行的模型步骤数
    #[serde(default)]
    pub step_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<SessionId>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            parent_id: None,
            agent_id: None,
            turns: Vec::new(),
            attributes: BTreeMap::new(),
            status: SessionStatus::Active,
            step_count: 0,
            pending_approval: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 为子智能体创建作用域子会话：继承属性，不继承历史
    pub fn scoped(parent: &Session, agent_id: &str) -> Self {
        let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let mut child = Self::new(format!("{}/{}/{}", parent.id, agent_id, suffix));
        child.parent_id = Some(parent.id.clone());
        child.agent_id = Some(agent_id.to_string());
        child.attributes = parent.attributes.clone();
        child
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// 追加一条 turn；时间戳不早于上一条
    pub fn push(&mut self, mut turn: Turn) {
        if let Some(last) = self.turns.last() {
            if turn.timestamp < last.timestamp {
                turn.timestamp = last.timestamp;
            }
        }
        self.updated_at = turn.timestamp.max(self.updated_at);
        self.turns.push(turn);
    }

    pub fn last_assistant_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .filter(|t| t.role == Role::Assistant)
            .find_map(|t| t.text())
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.status, SessionStatus::Terminated { .. })
    }

    pub fn is_awaiting_approval(&self) -> bool {
        self.status == SessionStatus::AwaitingApproval
    }

    pub fn terminate(&mut self, reason: TerminationReason) {
        self.status = SessionStatus::Terminated { reason };
        self.updated_at = Utc::now().max(self.updated_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_push_keeps_timestamps_monotonic() {
        let mut session = Session::new("s1");
        session.push(Turn::user("hi"));
        let mut early = Turn::assistant("hello");
        early.timestamp = session.turns()[0].timestamp - Duration::seconds(10);
        session.push(early);
        assert_eq!(session.turns().len(), 2);
        assert!(session.turns()[1].timestamp >= session.turns()[0].timestamp);
    }

    #[test]
    fn test_scoped_inherits_attributes_only() {
        let mut parent = Session::new("p").with_attribute("locale", "en");
        parent.push(Turn::user("book"));
        let child = Session::scoped(&parent, "reservations");
        assert!(child.id.starts_with("p/reservations/"));
        assert_eq!(child.parent_id.as_deref(), Some("p"));
        assert_eq!(child.attributes.get("locale").map(String::as_str), Some("en"));
        assert!(child.turns().is_empty());
    }

    #[test]
    fn test_render_tool_turns() {
        let call = ToolCallRequest {
            id: "c1".to_string(),
            tool: "echo".to_string(),
            args: json!({"text": "x"}),
        };
        let rendered = Turn::tool_call(call.clone()).render();
        assert!(rendered.contains("\"tool\":\"echo\""));
        let result = ToolResult::success(&call, json!("x"));
        assert_eq!(Turn::tool_result(result).render(), "[tool_result id=c1 tool=echo ok=true] x");
    }

    #[test]
    fn test_session_roundtrips_through_json() {
        let mut session = Session::new("s2").with_attribute("user", "ann");
        session.push(Turn::user("hi"));
        session.terminate(TerminationReason::EndSignal);
        let raw = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.turns(), session.turns());
        assert!(back.is_terminated());
    }
}
