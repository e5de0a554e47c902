//! 工具调用请求与结果
//!
//! 每个 ToolCallRequest 在下一次模型调用前必须有且只有一个相同 correlation id 的 ToolResult。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 模型发起的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// correlation id；模型未提供时由循环生成
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCallRequest {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            id: new_correlation_id(),
            tool: tool.into(),
            args,
        }
    }
}

pub fn new_correlation_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// 结构化错误类别（序列化后直接给模型看）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolErrorKind {
    #[serde(rename = "SchemaValidationError")]
    SchemaValidation,
    #[serde(rename = "ToolExecutionError")]
    Execution,
    #[serde(rename = "ToolTimeout")]
    Timeout,
    #[serde(rename = "UnknownTool")]
    UnknownTool,
    #[serde(rename = "ApprovalRequired")]
    ApprovalRequired,
    #[serde(rename = "ApprovalDenied")]
    ApprovalDenied,
    #[serde(rename = "RetrievalError")]
    Retrieval,
    #[serde(rename = "DelegationError")]
    Delegation,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SchemaValidation => "SchemaValidationError",
            Self::Execution => "ToolExecutionError",
            Self::Timeout => "ToolTimeout",
            Self::UnknownTool => "UnknownTool",
            Self::ApprovalRequired => "ApprovalRequired",
            Self::ApprovalDenied => "ApprovalDenied",
            Self::Retrieval => "RetrievalError",
            Self::Delegation => "DelegationError",
        }
    }

    /// 执行失败与超时属于可自动重试的类别（仍需工具声明幂等）
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution | Self::Timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
    /// 是否已自动重试过
    #[serde(default)]
    pub retried: bool,
}

/// 工具调用结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub correlation_id: String,
    pub tool: String,
    pub success: bool,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResult {
    pub fn success(call: &ToolCallRequest, payload: Value) -> Self {
        Self {
            correlation_id: call.id.clone(),
            tool: call.tool.clone(),
            success: true,
            payload,
            error: None,
        }
    }

    pub fn failure(call: &ToolCallRequest, kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            correlation_id: call.id.clone(),
            tool: call.tool.clone(),
            success: false,
            payload: Value::Null,
            error: Some(ToolError {
                kind,
                message: message.into(),
                retried: false,
            }),
        }
    }

    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// 供模型阅读的单行文本
    pub fn render(&self) -> String {
        match &self.error {
            None => match &self.payload {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            Some(e) => serde_json::json!({
                "error": {
                    "kind": e.kind.as_str(),
                    "message": e.message,
                    "retried": e.retried,
                }
            })
            .to_string(),
        }
    }
}
