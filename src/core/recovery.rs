//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供编排循环、工具执行器与 Orchestrator 决定
//! 是回灌给模型、重试一次、退避、整步重试、带拒绝标记继续，还是终止。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::SchemaValidation { tool, violation } => RecoveryAction::FeedBackToModel(
                format!(
                    "Arguments for `{tool}` were rejected ({violation}). \
                     Call the tool again with arguments matching its input schema."
                ),
            ),
            AgentError::UnknownTool(name) => RecoveryAction::FeedBackToModel(format!(
                "Tool `{name}` does not exist. Use one of the declared tools."
            )),
            AgentError::ToolExecution { .. } | AgentError::ToolTimeout(_) => {
                RecoveryAction::RetryOnce
            }
            AgentError::ApprovalDenied { action, rationale } => {
                let mut msg = format!(
                    "Approval denied: the action `{action}` was not performed and must not be retried."
                );
                if let Some(r) = rationale {
                    msg.push_str(&format!(" Reviewer rationale: {r}"));
                }
                RecoveryAction::ResumeWithDenial(msg)
            }
            AgentError::VersionConflict { .. } => RecoveryAction::RetryStep,
            // 重试客户端已退避过；走到这里说明已耗尽
            AgentError::ModelUnavailable { .. } => RecoveryAction::Abort,
            AgentError::Cancelled(_) => RecoveryAction::Abort,
            _ => RecoveryAction::Abort,
        }
    }

    /// 瞬时的模型错误是否值得退避重试
    pub fn handle_model_error(&self, transient: bool) -> RecoveryAction {
        if transient {
            RecoveryAction::Backoff
        } else {
            RecoveryAction::Abort
        }
    }
}
