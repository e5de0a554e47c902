//! 检索网关：外部语义检索能力的类型化客户端
//!
//! `search(query, k, filters) -> [{content, score, source_id}]`。HttpRetrievalGateway 走 JSON POST，
//! InMemoryRetrievalGateway 在进程内对已加载文档打分（词重叠，或带查询向量时用余弦相似度）。

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::llm::HashingEmbedder;
use crate::retrieval::tokenizer::{content_tokens, coverage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    pub text: String,
    pub k: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, String>,
    /// 额外的查询向量（HyDE）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>, k: usize) -> Self {
        Self {
            text: text.into(),
            k,
            filters: BTreeMap::new(),
            vector: None,
        }
    }

    pub fn with_filters(mut self, filters: BTreeMap<String, String>) -> Self {
        self.filters = filters;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub content: String,
    pub score: f32,
    pub source_id: String,
    /// 来源更新时间，用于同分排序
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetrievalError {
    #[error("retrieval request failed: {0}")]
    Http(String),
    #[error("retrieval endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("cannot decode retrieval response: {0}")]
    Decode(String),
    #[error("retrieval cancelled")]
    Cancelled,
}

#[async_trait]
pub trait RetrievalGateway: Send + Sync {
    async fn search(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalHit>, RetrievalError>;
}

/// 余弦相似度
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// HTTP 检索网关：POST {query, k, filters, vector?}，响应为 {"hits": [...]} 或直接数组
pub struct HttpRetrievalGateway {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HttpSearchResponse {
    Wrapped { hits: Vec<RetrievalHit> },
    Bare(Vec<RetrievalHit>),
}

impl HttpRetrievalGateway {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RetrievalError::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl RetrievalGateway for HttpRetrievalGateway {
    async fn search(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalHit>, RetrievalError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "query": query.text,
                "k": query.k,
                "filters": query.filters,
                "vector": query.vector,
            }))
            .send()
            .await
            .map_err(|e| RetrievalError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: HttpSearchResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::Decode(e.to_string()))?;
        let mut hits = match parsed {
            HttpSearchResponse::Wrapped { hits } | HttpSearchResponse::Bare(hits) => hits,
        };
        hits.truncate(query.k);
        tracing::debug!(query = %query.text, hits = hits.len(), "http retrieval");
        Ok(hits)
    }
}

/// 进程内文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub source_id: String,
    pub content: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(source_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            content: content.into(),
            updated_at: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn updated(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }
}

struct IndexedDocument {
    doc: Document,
    embedding: Vec<f32>,
}

/// 进程内检索网关（测试与离线运行）
pub struct InMemoryRetrievalGateway {
    docs: RwLock<Vec<IndexedDocument>>,
    embedder: HashingEmbedder,
}

impl InMemoryRetrievalGateway {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(Vec::new()),
            embedder: HashingEmbedder::default(),
        }
    }

    pub fn with_documents(docs: Vec<Document>) -> Self {
        let embedder = HashingEmbedder::default();
        let indexed = docs
            .into_iter()
            .map(|doc| IndexedDocument {
                embedding: embedder.embed_now(&doc.content),
                doc,
            })
            .collect();
        Self {
            docs: RwLock::new(indexed),
            embedder,
        }
    }

    pub async fn add(&self, doc: Document) {
        let embedding = self.embedder.embed_now(&doc.content);
        self.docs.write().await.push(IndexedDocument { doc, embedding });
    }

    /// 从 JSON 文件加载文档数组
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, RetrievalError> {
        let raw = std::fs::read_to_string(path).map_err(|e| RetrievalError::Decode(e.to_string()))?;
        let docs: Vec<Document> =
            serde_json::from_str(&raw).map_err(|e| RetrievalError::Decode(e.to_string()))?;
        Ok(Self::with_documents(docs))
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryRetrievalGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RetrievalGateway for InMemoryRetrievalGateway {
    async fn search(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalHit>, RetrievalError> {
        let query_tokens = content_tokens(&query.text);
        let docs = self.docs.read().await;
        let mut hits: Vec<RetrievalHit> = docs
            .iter()
            .filter(|d| {
                query
                    .filters
                    .iter()
                    .all(|(k, v)| d.doc.metadata.get(k) == Some(v))
            })
            .map(|d| {
                let score = match &query.vector {
                    Some(v) => cosine_similarity(v, &d.embedding),
                    None => coverage(&query_tokens, &content_tokens(&d.doc.content)),
                };
                RetrievalHit {
                    content: d.doc.content.clone(),
                    score,
                    source_id: d.doc.source_id.clone(),
                    updated_at: d.doc.updated_at,
                }
            })
            .filter(|h| h.score > 0.0)
            .collect();
        // 稳定排序：同分保持文档加载顺序
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(query.k);
        Ok(hits)
    }
}
