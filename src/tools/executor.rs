//! 工具执行器
//!
//! 持有 ToolRegistry 与 TaskScheduler：每次调用先取并发许可，再经 registry 校验并执行；
//! 幂等工具执行失败或超时时自动重试一次，非幂等工具直接返回失败；可被会话取消令牌中断。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, RecoveryAction, RecoveryEngine, TaskScheduler};
use crate::tools::{ToolCallRequest, ToolErrorKind, ToolRegistry, ToolResult};

/// 工具执行器：并发限制 + 取消 + 一次自动重试 + 审计
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    scheduler: Arc<TaskScheduler>,
    recovery: RecoveryEngine,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            registry,
            scheduler,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 执行一次工具调用；只有取消会以 Err 返回，其余失败都在 ToolResult 中
    pub async fn execute(
        &self,
        call: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, AgentError> {
        let start = Instant::now();
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled(format!("tool {}", call.tool))),
            permit = self.scheduler.acquire_tool() => permit?,
        };

        let mut attempts = 1u32;
        let mut result = self.invoke_cancellable(call, cancel).await?;

        if let Some(kind) = result.error_kind() {
            let err = match kind {
                ToolErrorKind::Timeout => AgentError::ToolTimeout(call.tool.clone()),
                _ => AgentError::ToolExecution {
                    tool: call.tool.clone(),
                    message: result.render(),
                },
            };
            let retry = kind.is_retryable()
                && self.registry.is_idempotent(&call.tool)
                && self.recovery.handle(&err) == RecoveryAction::RetryOnce;
            if retry {
                tracing::warn!(tool = %call.tool, correlation_id = %call.id, "idempotent tool failed, retrying once");
                attempts += 1;
                result = self.invoke_cancellable(call, cancel).await?;
                if let Some(e) = result.error.as_mut() {
                    e.retried = true;
                }
            }
        }

        let outcome = match result.error_kind() {
            None => "ok",
            Some(k) => k.as_str(),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.tool,
            "correlation_id": call.id,
            "ok": result.success,
            "outcome": outcome,
            "attempts": attempts,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        Ok(result)
    }

    async fn invoke_cancellable(
        &self,
        call: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, AgentError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled(format!("tool {}", call.tool))),
            result = self.registry.invoke(call) => Ok(result),
        }
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
