//! 模型客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock / Scripted）实现 ModelClient：invoke（非流式）、
//! invoke_stream（有序事件流，以 Completed 或 Cancelled 结束）。流式增量可由 assemble_stream
//! 拼成与非流式相同的 ModelResponse；invoke_streaming 把建立流与拼装作为一次完整调用。

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::{RecoveryAction, RecoveryEngine};
use crate::llm::protocol::parse_model_output;
use crate::session::Turn;
use crate::tools::{ToolCallRequest, ToolSpec};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("invalid model request: {0}")]
    InvalidRequest(String),
    #[error("model call cancelled")]
    Cancelled,
    #[error("model unavailable after {attempts} attempt(s): {message}")]
    Exhausted { attempts: u32, message: String },
}

impl ModelError {
    /// 瞬时故障：可退避重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout(_) | Self::RateLimited { .. }
        )
    }
}

/// 一次模型调用的完整上下文
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    /// 已渲染好的 system prompt（含工具描述与属性）
    pub system_prompt: String,
    pub history: Vec<Turn>,
    pub tool_specs: Vec<ToolSpec>,
    pub attributes: BTreeMap<String, String>,
    pub streaming: bool,
}

/// 模型回复：文本、工具调用，或二者皆有（工具调用优先）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    /// 模型原始输出
    pub raw: String,
}

impl ModelResponse {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        parse_model_output(&raw.into())
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// 流式事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelEvent {
    TextDelta(String),
    /// 正常结束
    Completed,
    /// 提供方中止了本次流
    Cancelled,
}

pub type ModelEventStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, ModelError>> + Send>>;

#[async_trait]
pub trait ModelClient: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;

    /// 默认实现：一次性 invoke 后按单个增量回放
    async fn invoke_stream(&self, request: &ModelRequest) -> Result<ModelEventStream, ModelError> {
        let response = self.invoke(request).await?;
        Ok(Box::pin(stream::iter(vec![
            Ok(ModelEvent::TextDelta(response.raw)),
            Ok(ModelEvent::Completed),
        ])))
    }

    /// 流式调用并拼装为完整回复，每段增量回调 on_delta
    async fn invoke_streaming(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<ModelResponse, ModelError> {
        let events = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            s = self.invoke_stream(request) => s?,
        };
        assemble_stream(events, cancel, on_delta).await
    }

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 把流式增量拼成 ModelResponse；on_delta 对每段增量回调（用于前端逐段展示）
pub async fn assemble_stream(
    mut events: ModelEventStream,
    cancel: &CancellationToken,
    mut on_delta: impl FnMut(&str) + Send,
) -> Result<ModelResponse, ModelError> {
    let mut raw = String::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            next = events.next() => next,
        };
        match next {
            Some(Ok(ModelEvent::TextDelta(delta))) => {
                on_delta(&delta);
                raw.push_str(&delta);
            }
            Some(Ok(ModelEvent::Completed)) => return Ok(ModelResponse::from_raw(raw)),
            Some(Ok(ModelEvent::Cancelled)) => return Err(ModelError::Cancelled),
            Some(Err(e)) => return Err(e),
            None => {
                return Err(ModelError::Unavailable(
                    "stream ended without a completion marker".to_string(),
                ))
            }
        }
    }
}

/// 退避重试配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次失败（从 1 开始）之后的等待时间
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.initial_backoff.mul_f64(factor).min(self.max_backoff)
    }
}

/// 为任意客户端加上有界指数退避；非瞬时错误立即返回，重试耗尽返回 Exhausted
pub struct RetryingModelClient {
    inner: Arc<dyn ModelClient>,
    config: RetryConfig,
    recovery: RecoveryEngine,
}

impl RetryingModelClient {
    pub fn new(inner: Arc<dyn ModelClient>, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            recovery: RecoveryEngine::new(),
        }
    }

    /// 返回 Some(等待时间) 表示应重试
    fn next_delay(&self, err: &ModelError, attempt: u32) -> Option<Duration> {
        if self.recovery.handle_model_error(err.is_transient()) != RecoveryAction::Backoff
            || attempt >= self.config.max_attempts
        {
            return None;
        }
        let delay = match err {
            ModelError::RateLimited {
                retry_after_ms: Some(ms),
            } => Duration::from_millis(*ms).min(self.config.max_backoff),
            _ => self.config.backoff_for(attempt),
        };
        Some(delay)
    }

    fn exhausted(&self, err: ModelError, attempt: u32) -> ModelError {
        if err.is_transient() {
            ModelError::Exhausted {
                attempts: attempt,
                message: err.to_string(),
            }
        } else {
            err
        }
    }
}

#[async_trait]
impl ModelClient for RetryingModelClient {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.invoke(request).await {
                Ok(r) => return Ok(r),
                Err(e) => match self.next_delay(&e, attempt) {
                    Some(delay) => {
                        tracing::warn!(model = self.inner.name(), attempt, error = %e, ?delay, "model call failed, backing off");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(self.exhausted(e, attempt)),
                },
            }
        }
    }

    /// 只重试建立流的阶段；流中途的错误由 invoke_streaming 整体重试
    async fn invoke_stream(&self, request: &ModelRequest) -> Result<ModelEventStream, ModelError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.invoke_stream(request).await {
                Ok(s) => return Ok(s),
                Err(e) => match self.next_delay(&e, attempt) {
                    Some(delay) => {
                        tracing::warn!(model = self.inner.name(), attempt, error = %e, "model stream failed to open, backing off");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(self.exhausted(e, attempt)),
                },
            }
        }
    }

    /// 建立流 + 拼装整体重试：流中途断开也按退避重放整次调用
    async fn invoke_streaming(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<ModelResponse, ModelError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.invoke_streaming(request, cancel, &mut *on_delta).await {
                Ok(r) => return Ok(r),
                Err(e) => match self.next_delay(&e, attempt) {
                    Some(delay) => {
                        tracing::warn!(model = self.inner.name(), attempt, error = %e, ?delay, "model stream failed, backing off");
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => return Err(self.exhausted(e, attempt)),
                },
            }
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Scripted, ScriptedModelClient};

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_assemble_matches_invoke_shape() {
        let events: ModelEventStream = Box::pin(stream::iter(vec![
            Ok(ModelEvent::TextDelta("{\"tool\": \"echo\", ".to_string())),
            Ok(ModelEvent::TextDelta("\"args\": {\"text\": \"hi\"}}".to_string())),
            Ok(ModelEvent::Completed),
        ]));
        let mut seen = Vec::new();
        let response = assemble_stream(events, &CancellationToken::new(), |d| seen.push(d.to_string()))
            .await
            .unwrap();
        assert_eq!(seen.len(), 2);
        let direct = ModelResponse::from_raw("{\"tool\": \"echo\", \"args\": {\"text\": \"hi\"}}");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].tool, direct.tool_calls[0].tool);
        assert_eq!(response.tool_calls[0].args, direct.tool_calls[0].args);
    }

    #[tokio::test]
    async fn test_assemble_requires_completion_marker() {
        let events: ModelEventStream =
            Box::pin(stream::iter(vec![Ok(ModelEvent::TextDelta("partial".to_string()))]));
        let err = assemble_stream(events, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Unavailable(_)));

        let events: ModelEventStream = Box::pin(stream::iter(vec![
            Ok(ModelEvent::TextDelta("partial".to_string())),
            Ok(ModelEvent::Cancelled),
        ]));
        let err = assemble_stream(events, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, ModelError::Cancelled);
    }

    #[tokio::test]
    async fn test_assemble_honours_cancel_token() {
        let events: ModelEventStream = Box::pin(stream::pending());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = assemble_stream(events, &cancel, |_| {}).await.unwrap_err();
        assert_eq!(err, ModelError::Cancelled);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let scripted = Arc::new(ScriptedModelClient::new(vec![
            Scripted::Error(ModelError::Unavailable("503".into())),
            Scripted::Output("done".into()),
        ]));
        let client = RetryingModelClient::new(scripted.clone(), fast_retry(3));
        let response = client.invoke(&ModelRequest::default()).await.unwrap();
        assert_eq!(response.text.as_deref(), Some("done"));
        assert_eq!(scripted.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_and_permanent_errors() {
        let scripted = Arc::new(ScriptedModelClient::new(vec![
            Scripted::Error(ModelError::Unavailable("a".into())),
            Scripted::Error(ModelError::Timeout(Duration::from_secs(1))),
        ]));
        let client = RetryingModelClient::new(scripted, fast_retry(2));
        let err = client.invoke(&ModelRequest::default()).await.unwrap_err();
        assert!(matches!(err, ModelError::Exhausted { attempts: 2, .. }));

        let scripted = Arc::new(ScriptedModelClient::new(vec![Scripted::Error(
            ModelError::InvalidRequest("bad".into()),
        )]));
        let client = RetryingModelClient::new(scripted.clone(), fast_retry(5));
        let err = client.invoke(&ModelRequest::default()).await.unwrap_err();
        assert!(matches!(err, ModelError::InvalidRequest(_)));
        assert_eq!(scripted.requests().len(), 1);
    }

    /// 第一次流中途断开，之后的流正常结束
    struct BrokenOnce {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ModelClient for BrokenOnce {
        fn name(&self) -> &str {
            "broken-once"
        }

        async fn invoke(&self, _request: &ModelRequest) -> Result<ModelResponse, ModelError> {
            Err(ModelError::InvalidRequest("streaming only".into()))
        }

        async fn invoke_stream(&self, _request: &ModelRequest) -> Result<ModelEventStream, ModelError> {
            let events = if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                vec![
                    Ok(ModelEvent::TextDelta("par".into())),
                    Err(ModelError::Unavailable("connection reset".into())),
                ]
            } else {
                vec![Ok(ModelEvent::TextDelta("whole".into())), Ok(ModelEvent::Completed)]
            };
            Ok(Box::pin(stream::iter(events)))
        }
    }

    #[tokio::test]
    async fn test_streaming_retries_after_mid_stream_failure() {
        let inner = Arc::new(BrokenOnce {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let client = RetryingModelClient::new(inner.clone(), fast_retry(3));
        let mut deltas = Vec::new();
        let response = client
            .invoke_streaming(&ModelRequest::default(), &CancellationToken::new(), &mut |d: &str| {
                deltas.push(d.to_string())
            })
            .await
            .unwrap();
        assert_eq!(response.text.as_deref(), Some("whole"));
        assert_eq!(inner.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(deltas, vec!["par", "whole"]);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let cfg = RetryConfig {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            multiplier: 2.0,
        };
        assert_eq!(cfg.backoff_for(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff_for(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff_for(3), Duration::from_millis(350));
    }
}
