//! Mock 模型客户端（用于本地运行与测试，无需 API）
//!
//! - MockModelClient：第一步把用户最后一句通过 echo 工具回显，拿到工具结果后给出纯文本答复
//! - ScriptedModelClient：按顺序回放预设输出/错误，并记录收到的每个请求

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{ModelClient, ModelError, ModelRequest, ModelResponse};
use crate::session::{Role, TurnContent};

#[derive(Debug, Default)]
pub struct MockModelClient;

#[async_trait]
impl ModelClient for MockModelClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let last = request.history.last();
        if let Some(TurnContent::ToolResult { result }) = last.map(|t| &t.content) {
            return Ok(ModelResponse::from_raw(format!(
                "Mock answer based on {}: {}",
                result.tool,
                result.render()
            )));
        }
        let last_user = request
            .history
            .iter()
            .rev()
            .filter(|t| t.role == Role::User)
            .find_map(|t| t.text())
            .unwrap_or("(no input)");
        let can_echo = request.tool_specs.iter().any(|s| s.name == "echo");
        if !can_echo {
            return Ok(ModelResponse::from_raw(format!("Echo from Mock: {last_user}")));
        }
        let call = serde_json::json!({
            "tool": "echo",
            "args": { "text": format!("Echo from Mock: {last_user}") },
        });
        Ok(ModelResponse::from_raw(call.to_string()))
    }
}

type Responder = Box<dyn Fn(&ModelRequest) -> String + Send + Sync>;

/// 一条预设回复
pub enum Scripted {
    /// 原样作为模型输出
    Output(String),
    Error(ModelError),
    /// 根据请求动态生成输出（例如引用上一条工具结果里的 id）
    With(Responder),
}

impl Scripted {
    pub fn output(text: impl Into<String>) -> Self {
        Self::Output(text.into())
    }

    pub fn tool_call(tool: &str, args: serde_json::Value) -> Self {
        Self::Output(serde_json::json!({ "tool": tool, "args": args }).to_string())
    }

    pub fn with(f: impl Fn(&ModelRequest) -> String + Send + Sync + 'static) -> Self {
        Self::With(Box::new(f))
    }
}

/// 脚本化客户端：脚本耗尽后返回 Unavailable
pub struct ScriptedModelClient {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModelClient {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 追加脚本（会话中途续写）
    pub fn push(&self, item: Scripted) {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(item);
        }
    }

    /// 已收到的全部请求（按调用顺序）
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(request.clone());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(Scripted::Output(text)) => Ok(ModelResponse::from_raw(text)),
            Some(Scripted::With(f)) => Ok(ModelResponse::from_raw(f(request))),
            Some(Scripted::Error(e)) => Err(e),
            None => Err(ModelError::Unavailable("script exhausted".to_string())),
        }
    }
}
