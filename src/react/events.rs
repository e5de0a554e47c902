//! 编排过程事件：用于流式展示步骤、工具调用、检索、委派、审批与回复

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// 步数更新（当前第几步）
    StepUpdate {
        session_id: String,
        step: usize,
        max_steps: usize,
    },
    /// 正在调用模型
    Thinking,
    /// 流式模型输出的增量
    ModelDelta { text: String },
    ToolCall {
        tool: String,
        correlation_id: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        tool: String,
        correlation_id: String,
        ok: bool,
        preview: String,
    },
    Retrieval {
        query: String,
        sub_queries: Vec<String>,
        hits: usize,
    },
    Delegation {
        agent_id: String,
        task: String,
        depth: usize,
    },
    /// 挂起等待人工审批
    ApprovalRequested {
        correlation_id: String,
        action: String,
        description: String,
    },
    /// 错误恢复动作（FeedBackToModel / ResumeWithDenial / Abort 等）
    Recovery { action: String, detail: String },
    /// 最终回复的一小段
    MessageChunk { text: String },
    MessageDone,
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
    },
    Error { text: String },
}
