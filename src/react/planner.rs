//! Planner：组装模型请求并调用模型
//!
//! 上下文 = 窗口内的 turn 历史 + 会话属性 + 可用工具描述。窗口截断时不会从孤立的工具结果开始。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::llm::{render_system_prompt, ModelClient, ModelError, ModelRequest, ModelResponse};
use crate::session::{Role, Session, Turn};
use crate::tools::ToolSpec;

/// Planner：持有模型与基础 system prompt
pub struct Planner {
    model: Arc<dyn ModelClient>,
    system_prompt: String,
    /// 0 表示不截断
    max_context_turns: usize,
}

impl Planner {
    pub fn new(model: Arc<dyn ModelClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            model,
            system_prompt: system_prompt.into(),
            max_context_turns: 0,
        }
    }

    pub fn with_max_context_turns(mut self, turns: usize) -> Self {
        self.max_context_turns = turns;
        self
    }

    pub fn base_system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn model(&self) -> Arc<dyn ModelClient> {
        self.model.clone()
    }

    /// 获取模型累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.model.token_usage()
    }

    pub fn build_request(
        &self,
        session: &Session,
        tool_specs: Vec<ToolSpec>,
        system_prompt: &str,
        streaming: bool,
    ) -> ModelRequest {
        ModelRequest {
            system_prompt: render_system_prompt(system_prompt, &tool_specs, &session.attributes),
            history: window(session.turns(), self.max_context_turns),
            tool_specs,
            attributes: session.attributes.clone(),
            streaming,
        }
    }

    /// 调用模型；streaming 时逐段回调 on_delta，最终拼成同样的 ModelResponse
    pub async fn plan(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
        on_delta: impl FnMut(&str) + Send,
    ) -> Result<ModelResponse, ModelError> {
        if request.streaming {
            let mut on_delta = on_delta;
            return self.model.invoke_streaming(request, cancel, &mut on_delta).await;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ModelError::Cancelled),
            r = self.model.invoke(request) => r,
        }
    }
}

/// 取最近 max 条 turn；起点落在工具结果上时后移，保证调用与结果成对出现
fn window(turns: &[Turn], max: usize) -> Vec<Turn> {
    if max == 0 || turns.len() <= max {
        return turns.to_vec();
    }
    let mut start = turns.len() - max;
    while start < turns.len() && turns[start].role == Role::Tool {
        start += 1;
    }
    turns[start..].to_vec()
}
