//! 检索查询流水线：把原始问题变成排好序、去重的证据集合
//!
//! 阶段（均可单独开关）：意图分类 → 规范化 → 分解 → 扩展 → HyDE。
//! 分解与扩展产生的子查询并发执行（受 TaskScheduler 的查询池限制），只在本步骤内 join。

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use futures_util::future::join_all;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::RetrievalSection;
use crate::core::TaskScheduler;
use crate::llm::{Embedder, ModelClient, ModelRequest};
use crate::retrieval::tokenizer::tokenize;
use crate::retrieval::{merge_results, RetrievalError, RetrievalGateway, RetrievalHit, RetrievalQuery};
use crate::session::Turn;

/// 流水线开关与规则
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub default_k: usize,
    pub classify: bool,
    pub normalize: bool,
    pub decompose: bool,
    pub expand: bool,
    pub hyde: bool,
    /// 扩展阶段生成的改写数
    pub expansions: usize,
    /// 非空时查询必须命中其中至少一个词
    pub allowed_topics: Vec<String>,
    pub blocked_topics: Vec<String>,
    /// 规范化同义词表：口语/歧义说法 → 规范说法
    pub synonyms: BTreeMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_k: 5,
            classify: true,
            normalize: true,
            decompose: true,
            expand: false,
            hyde: false,
            expansions: 2,
            allowed_topics: Vec::new(),
            blocked_topics: Vec::new(),
            synonyms: BTreeMap::new(),
        }
    }
}

impl From<&RetrievalSection> for PipelineConfig {
    fn from(cfg: &RetrievalSection) -> Self {
        Self {
            default_k: cfg.default_k,
            classify: cfg.stages.classify,
            normalize: cfg.stages.normalize,
            decompose: cfg.stages.decompose,
            expand: cfg.stages.expand,
            hyde: cfg.stages.hyde,
            expansions: cfg.expansions,
            allowed_topics: cfg.allowed_topics.clone(),
            blocked_topics: cfg.blocked_topics.clone(),
            synonyms: cfg.synonyms.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    InDomain,
    OutOfDomain { reason: String },
}

/// 规则意图分类：命中屏蔽词或未命中任何允许主题时拒绝
pub fn classify_intent(query: &str, allowed: &[String], blocked: &[String]) -> Intent {
    let tokens = tokenize(query);
    let mentions = |topic: &String| {
        let topic_tokens = tokenize(topic);
        !topic_tokens.is_empty()
            && tokens
                .windows(topic_tokens.len())
                .any(|w| w == topic_tokens.as_slice())
    };
    if let Some(topic) = blocked.iter().find(|t| mentions(t)) {
        return Intent::OutOfDomain {
            reason: format!("questions about `{topic}` are out of scope"),
        };
    }
    if !allowed.is_empty() && !allowed.iter().any(mentions) {
        return Intent::OutOfDomain {
            reason: format!("I can only help with: {}", allowed.join(", ")),
        };
    }
    Intent::InDomain
}

/// 规范化：小写、压缩空白、去掉尾部标点，再按词边界替换同义词（长短语优先）
pub fn normalize_query(query: &str, synonyms: &BTreeMap<String, String>) -> String {
    let mut q = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    while q.ends_with(['?', '!', '.', '？', '！', '。']) {
        q.pop();
    }
    let mut pairs: Vec<(&String, &String)> = synonyms.iter().collect();
    pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));
    for (from, to) in pairs {
        let pattern = format!(r"\b{}\b", regex::escape(&from.to_lowercase()));
        if let Ok(re) = Regex::new(&pattern) {
            q = re.replace_all(&q, to.as_str()).into_owned();
        }
    }
    q.trim().to_string()
}

static CONJUNCTION_RE: OnceLock<Regex> = OnceLock::new();
static TRAILING_CONTEXT_RE: OnceLock<Regex> = OnceLock::new();

fn conjunction_re() -> &'static Regex {
    CONJUNCTION_RE.get_or_init(|| {
        Regex::new(r"(?i)\s*(?:\band also\b|\band\b|\bplus\b|\bas well as\b|;|\?|&|和|以及)\s*").unwrap()
    })
}

/// 尾部限定语，如 "in paris"、"for next week"
fn trailing_context_re() -> &'static Regex {
    TRAILING_CONTEXT_RE.get_or_init(|| {
        Regex::new(r"(?i)\s+(?:in|at|near|around|for|from|to|on|during)\s+[^,]+$").unwrap()
    })
}

/// 分解复合问题：按连接词切分，最后一段的尾部限定语（如 "in paris"）补给缺少限定语的其他子查询
pub fn decompose_query(query: &str) -> Vec<String> {
    let parts: Vec<String> = conjunction_re()
        .split(query)
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() <= 1 {
        return vec![query.trim().to_string()];
    }
    let context = parts
        .last()
        .and_then(|last| trailing_context_re().find(last))
        .map(|m| m.as_str().trim().to_string());
    let mut out: Vec<String> = Vec::new();
    for part in parts {
        let sub = match &context {
            Some(ctx) if !trailing_context_re().is_match(&part) => format!("{part} {ctx}"),
            _ => part,
        };
        if !out.contains(&sub) {
            out.push(sub);
        }
    }
    out
}

/// 流水线输出
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// 领域外，直接拒答，不做检索
    Rejected { reason: String },
    Evidence(RetrievalResult),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalResult {
    pub normalized: String,
    pub sub_queries: Vec<String>,
    pub hits: Vec<RetrievalHit>,
}

pub struct QueryPipeline {
    gateway: Arc<dyn RetrievalGateway>,
    config: PipelineConfig,
    scheduler: Arc<TaskScheduler>,
    model: Option<Arc<dyn ModelClient>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl QueryPipeline {
    pub fn new(
        gateway: Arc<dyn RetrievalGateway>,
        config: PipelineConfig,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        Self {
            gateway,
            config,
            scheduler,
            model: None,
            embedder: None,
        }
    }

    /// 扩展与 HyDE 阶段需要模型
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(
        &self,
        raw_query: &str,
        k: Option<usize>,
        filters: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, RetrievalError> {
        let k = k.unwrap_or(self.config.default_k).max(1);

        if self.config.classify {
            if let Intent::OutOfDomain { reason } = classify_intent(
                raw_query,
                &self.config.allowed_topics,
                &self.config.blocked_topics,
            ) {
                tracing::info!(query = %raw_query, %reason, "retrieval query rejected");
                return Ok(PipelineOutcome::Rejected { reason });
            }
        }

        let normalized = if self.config.normalize {
            normalize_query(raw_query, &self.config.synonyms)
        } else {
            raw_query.trim().to_string()
        };

        let sub_queries = if self.config.decompose {
            decompose_query(&normalized)
        } else {
            vec![normalized.clone()]
        };

        let mut queries: Vec<RetrievalQuery> = Vec::new();
        for sub in &sub_queries {
            queries.push(RetrievalQuery::new(sub.clone(), k).with_filters(filters.clone()));
            if self.config.expand {
                for alt in self.expand(sub, cancel).await {
                    queries.push(RetrievalQuery::new(alt, k).with_filters(filters.clone()));
                }
            }
            if self.config.hyde {
                if let Some(vector) = self.hyde(sub, cancel).await {
                    let mut q = RetrievalQuery::new(sub.clone(), k).with_filters(filters.clone());
                    q.vector = Some(vector);
                    queries.push(q);
                }
            }
        }
        tracing::debug!(sub_queries = ?sub_queries, total = queries.len(), "retrieval fan-out");

        let searches = queries.iter().map(|q| async move {
            let _permit = self
                .scheduler
                .acquire_query()
                .await
                .map_err(|_| RetrievalError::Cancelled)?;
            self.gateway.search(q).await
        });
        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetrievalError::Cancelled),
            results = join_all(searches) => results,
        };

        let mut lists = Vec::new();
        let mut first_error = None;
        for (q, result) in queries.iter().zip(results) {
            match result {
                Ok(hits) => lists.push(hits),
                Err(e) => {
                    tracing::warn!(query = %q.text, error = %e, "sub-query failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if lists.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        let mut hits = merge_results(lists);
        hits.truncate(k * sub_queries.len());
        Ok(PipelineOutcome::Evidence(RetrievalResult {
            normalized,
            sub_queries,
            hits,
        }))
    }

    async fn ask(&self, prompt: String, cancel: &CancellationToken) -> Option<String> {
        let model = self.model.as_ref()?;
        let request = ModelRequest {
            system_prompt: "You rewrite search queries. Reply with plain text only.".to_string(),
            history: vec![Turn::user(prompt)],
            ..Default::default()
        };
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            r = model.invoke(&request) => r,
        };
        match response {
            Ok(r) => Some(r.text.unwrap_or(r.raw)),
            Err(e) => {
                tracing::warn!(error = %e, "query rewrite model call failed, skipping stage");
                None
            }
        }
    }

    /// 扩展：模型生成改写，每行一条
    async fn expand(&self, query: &str, cancel: &CancellationToken) -> Vec<String> {
        let n = self.config.expansions;
        if n == 0 {
            return Vec::new();
        }
        let prompt = format!(
            "Write {n} alternative phrasings of this search query, one per line, no numbering:\n{query}"
        );
        let Some(text) = self.ask(prompt, cancel).await else {
            return Vec::new();
        };
        let mut out: Vec<String> = Vec::new();
        for line in text.lines() {
            let alt = line
                .trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '.' | ')' | '-' | '*'))
                .trim()
                .to_lowercase();
            if !alt.is_empty() && alt != query && !out.contains(&alt) {
                out.push(alt);
            }
            if out.len() == n {
                break;
            }
        }
        out
    }

    /// HyDE：模型写一段假想答案，嵌入后作为额外查询向量
    async fn hyde(&self, query: &str, cancel: &CancellationToken) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        let passage = self
            .ask(
                format!("Write a short factual passage that would answer: {query}"),
                cancel,
            )
            .await?;
        match embedder.embed(&passage).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "HyDE embedding failed");
                None
            }
        }
    }
}
