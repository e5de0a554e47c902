//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：可恢复的错误转为模型可见的上下文，
//! 只有不可恢复的错误（模型重试耗尽、版本冲突重试耗尽等）以 RunFailure 形式交给调用方。

use thiserror::Error;

use crate::session::Turn;
use crate::tools::SchemaViolation;

/// 编排过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("SchemaValidationError for {tool}: {violation}")]
    SchemaValidation {
        tool: String,
        violation: SchemaViolation,
    },

    #[error("ToolExecutionError in {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("ModelUnavailableError after {attempts} attempt(s): {message}")]
    ModelUnavailable { attempts: u32, message: String },

    #[error("StepBudgetExceeded: no final answer within {0} steps")]
    StepBudgetExceeded(usize),

    #[error("ApprovalDenied for {action}: {}", rationale.as_deref().unwrap_or("no rationale given"))]
    ApprovalDenied {
        action: String,
        rationale: Option<String>,
    },

    #[error("VersionConflict on session {session_id}: expected version {expected}, found {found}")]
    VersionConflict {
        session_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session terminated: {0}")]
    SessionTerminated(String),

    /// 同一 session 已有一个循环在执行
    #[error("Session busy: {0}")]
    SessionBusy(String),

    #[error("Session {0} is awaiting an approval decision")]
    AwaitingApproval(String),

    #[error("No pending approval matches {0}")]
    NoPendingApproval(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 不执行，转为结构化结果写回上下文，让模型自行修正
    FeedBackToModel(String),
    /// 幂等工具自动重试一次
    RetryOnce,
    /// 有界指数退避后重试（模型瞬时故障）
    Backoff,
    /// 调用方级别重试整个步骤（存储版本冲突）
    RetryStep,
    /// 该委派分支终止，父循环携带拒绝标记继续
    ResumeWithDenial(String),
    /// 终止当前运行，把错误交给调用方
    Abort,
}

/// 不可恢复的失败：错误本身 + 失败时的部分轨迹
#[derive(Error, Debug, Clone)]
#[error("{error}")]
pub struct RunFailure {
    pub error: AgentError,
    pub trace: Vec<Turn>,
}

impl RunFailure {
    pub fn new(error: AgentError, trace: Vec<Turn>) -> Self {
        Self { error, trace }
    }

    /// 无轨迹的失败（会话尚未加载时）
    pub fn bare(error: AgentError) -> Self {
        Self {
            error,
            trace: Vec::new(),
        }
    }
}

impl From<AgentError> for RunFailure {
    fn from(error: AgentError) -> Self {
        Self::bare(error)
    }
}
