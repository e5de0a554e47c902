//! 嵌入 API：供 HyDE 与向量检索使用，调用 OpenAI 兼容的 /embeddings 端点

use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use crate::retrieval::tokenizer::tokenize;

/// 文本编码为向量
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedder {
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
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![]);
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| e.to_string())?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;
        Ok(response
            .data
            .first()
            .map(|e| e.embedding.clone())
            .unwrap_or_default())
    }
}

/// 离线哈希词袋嵌入：每个 token 哈希到固定维度并计数，再做 L2 归一化
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }

    pub fn embed_now(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dims];
        for token in tokenize(text) {
            // FNV-1a
            let mut h: u64 = 0xcbf29ce484222325;
            for b in token.as_bytes() {
                h ^= *b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            v[(h % self.dims as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        Ok(self.embed_now(text))
    }
}

/// 按配置创建嵌入器：有 API Key 时用 OpenAI 兼容端点，否则退化为本地哈希嵌入
pub fn create_embedder_from_config(
    base_url: Option<&str>,
    model: &str,
    api_key: Option<&str>,
) -> Arc<dyn Embedder> {
    let key = api_key
        .map(String::from)
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    match key.as_deref() {
        Some(k) if !k.is_empty() && k != "sk-placeholder" => {
            Arc::new(OpenAiEmbedder::new(base_url, model, Some(k)))
        }
        _ => {
            tracing::debug!("no OPENAI_API_KEY, using hashing embedder");
            Arc::new(HashingEmbedder::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::cosine_similarity;

    #[tokio::test]
    async fn test_hashing_embedder_similarity() {
        let e = HashingEmbedder::new(64);
        let a = e.embed("cheap flights to paris").await.unwrap();
        let b = e.embed("paris flights cheap").await.unwrap();
        let c = e.embed("chocolate cake recipe").await.unwrap();
        assert_eq!(a.len(), 64);
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
        assert!(e.embed("").await.unwrap().iter().all(|x| *x == 0.0));
    }
}
