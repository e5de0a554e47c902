//! 工具注册表
//!
//! 所有工具实现 Tool trait（spec / idempotent / execute），由 ToolRegistry 按名注册（启动期校验 spec），
//! invoke 时先按输入 schema 校验参数，再在超时内执行；超时与执行错误一样返回失败的 ToolResult。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::{ToolCallRequest, ToolErrorKind, ToolResult, ToolSpec};

/// 编排循环保留的工具名：检索意图、委派意图、模型结束会话信号
pub const RESERVED_TOOL_NAMES: [&str; 3] = ["retrieve", "delegate", "end_session"];

/// 默认单次工具调用超时（秒）
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

/// 工具 trait：描述（供模型理解与参数校验）、是否幂等、异步执行（args 已通过校验）
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    /// 幂等工具失败后可以自动重试一次；默认不幂等
    fn idempotent(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value) -> Result<Value, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>，保留注册顺序以便生成稳定的 prompt
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
    timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS))
    }
}

impl ToolRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            timeout,
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), AgentError> {
        self.register_arc(Arc::new(tool))
    }

    /// 启动期校验：spec 合法、非保留名、名称唯一
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let spec = tool.spec();
        spec.check().map_err(AgentError::Config)?;
        if RESERVED_TOOL_NAMES.contains(&spec.name.as_str()) {
            return Err(AgentError::Config(format!(
                "tool name `{}` is reserved by the orchestration loop",
                spec.name
            )));
        }
        if self.tools.contains_key(&spec.name) {
            return Err(AgentError::Config(format!(
                "tool `{}` registered twice",
                spec.name
            )));
        }
        let name = spec.name.clone();
        tracing::debug!(tool = %name, idempotent = tool.idempotent(), "tool registered");
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_idempotent(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.idempotent()).unwrap_or(false)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// 全部工具描述（注册顺序）
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.order
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.spec().clone())
            .collect()
    }

    /// 仅返回 names 中列出的工具描述（子智能体的工具范围）
    pub fn specs_for(&self, names: &[String]) -> Vec<ToolSpec> {
        self.specs()
            .into_iter()
            .filter(|s| names.iter().any(|n| n == &s.name))
            .collect()
    }

    /// 动态生成工具 schema JSON（与实际注册工具一致）
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self.specs().iter().map(|s| s.to_json_schema()).collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }

    /// 校验并执行一次：未知工具 / 参数不合法 / 超时 / 执行失败都转为失败的 ToolResult
    pub async fn invoke(&self, call: &ToolCallRequest) -> ToolResult {
        let Some(tool) = self.tools.get(&call.tool) else {
            return ToolResult::failure(
                call,
                ToolErrorKind::UnknownTool,
                format!("unknown tool `{}`; available: {}", call.tool, self.order.join(", ")),
            );
        };

        if let Err(violation) = tool.spec().validate_args(&call.args) {
            return ToolResult::failure(call, ToolErrorKind::SchemaValidation, violation.to_string());
        }

        match timeout(self.timeout, tool.execute(call.args.clone())).await {
            Ok(Ok(payload)) => ToolResult::success(call, payload),
            Ok(Err(e)) => ToolResult::failure(call, ToolErrorKind::Execution, e),
            Err(_) => ToolResult::failure(
                call,
                ToolErrorKind::Timeout,
                format!("`{}` timed out after {:?}", call.tool, self.timeout),
            ),
        }
    }
}
