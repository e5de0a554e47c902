//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 会话 turn 按角色映射为 chat 消息：工具调用作为 assistant 消息回放，工具结果作为 user 消息。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::llm::{ModelClient, ModelError, ModelEvent, ModelEventStream, ModelRequest, ModelResponse};
use crate::session::Role;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client、model 名与单次请求超时
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    name: String,
    model: String,
    timeout: Duration,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            name: format!("openai:{model}"),
            model: model.to_string(),
            timeout: Duration::from_secs(60),
            usage: TokenUsage::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn to_openai_messages(
        &self,
        request: &ModelRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, ModelError> {
        let mut messages = vec![ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(request.system_prompt.clone())
                .build()
                .map_err(invalid)?,
        )];
        for turn in &request.history {
            let content = turn.render();
            let message = match turn.role {
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(content)
                        .build()
                        .map_err(invalid)?,
                ),
                Role::User | Role::Tool => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(content)
                        .build()
                        .map_err(invalid)?,
                ),
            };
            messages.push(message);
        }
        Ok(messages)
    }

    fn build_request(
        &self,
        request: &ModelRequest,
        stream: bool,
    ) -> Result<CreateChatCompletionRequest, ModelError> {
        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(request)?)
            .stream(stream)
            .build()
            .map_err(invalid)
    }
}

fn invalid(e: OpenAIError) -> ModelError {
    ModelError::InvalidRequest(e.to_string())
}

/// 把 API 错误映射为 ModelError：参数错误不可重试，限流与网络错误可重试
fn classify(e: OpenAIError) -> ModelError {
    match e {
        OpenAIError::InvalidArgument(msg) => ModelError::InvalidRequest(msg),
        OpenAIError::ApiError(api) => {
            let kind = api.r#type.clone().unwrap_or_default();
            if kind.contains("rate") || api.message.to_lowercase().contains("rate limit") {
                ModelError::RateLimited {
                    retry_after_ms: None,
                }
            } else if kind.contains("invalid_request") {
                ModelError::InvalidRequest(api.message)
            } else {
                ModelError::Unavailable(api.message)
            }
        }
        other => ModelError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let body = self.build_request(request, false)?;
        let response = tokio::time::timeout(self.timeout, self.client.chat().create(body))
            .await
            .map_err(|_| ModelError::Timeout(self.timeout))?
            .map_err(classify)?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        tracing::debug!(model = %self.model, chars = content.len(), "model response");
        Ok(ModelResponse::from_raw(content))
    }

    async fn invoke_stream(&self, request: &ModelRequest) -> Result<ModelEventStream, ModelError> {
        let body = self.build_request(request, true)?;
        let upstream = tokio::time::timeout(self.timeout, self.client.chat().create_stream(body))
            .await
            .map_err(|_| ModelError::Timeout(self.timeout))?
            .map_err(classify)?;

        let usage = self.usage.clone();
        let deltas = upstream.map(move |chunk| {
            let chunk = chunk.map_err(classify)?;
            if let Some(u) = &chunk.usage {
                usage.add(u.prompt_tokens as u64, u.completion_tokens as u64);
            }
            let text: String = chunk
                .choices
                .iter()
                .filter_map(|c| c.delta.content.clone())
                .collect();
            Ok(ModelEvent::TextDelta(text))
        });
        Ok(Box::pin(
            deltas.chain(stream::once(async { Ok(ModelEvent::Completed) })),
        ))
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}
