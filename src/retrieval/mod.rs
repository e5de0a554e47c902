//! 检索层：网关客户端、查询流水线、结果合并与引用校验

pub mod citation;
pub mod gateway;
pub mod merge;
pub mod pipeline;
pub mod tokenizer;

use std::sync::Arc;
use std::time::Duration;

pub use citation::{CitationReport, CitationValidator, SentenceCheck, LOW_CONFIDENCE_MARKER};
pub use gateway::{
    cosine_similarity, Document, HttpRetrievalGateway, InMemoryRetrievalGateway, RetrievalError,
    RetrievalGateway, RetrievalHit, RetrievalQuery,
};
pub use merge::merge_results;
pub use pipeline::{
    classify_intent, decompose_query, normalize_query, Intent, PipelineConfig, PipelineOutcome,
    QueryPipeline, RetrievalResult,
};

use crate::config::RetrievalSection;
use crate::core::AgentError;

/// 按 [retrieval] 配置创建网关：有 endpoint 走 HTTP，否则用进程内文档（可从 documents 文件加载）
pub fn create_gateway_from_config(
    cfg: &RetrievalSection,
) -> Result<Arc<dyn RetrievalGateway>, AgentError> {
    if let Some(endpoint) = cfg.endpoint.as_deref().filter(|e| !e.is_empty()) {
        let gw = HttpRetrievalGateway::new(endpoint, Duration::from_secs(cfg.timeout_secs))
            .map_err(|e| AgentError::Config(e.to_string()))?;
        tracing::info!(endpoint, "http retrieval gateway");
        return Ok(Arc::new(gw));
    }
    match &cfg.documents {
        Some(path) => {
            let gw = InMemoryRetrievalGateway::from_json_file(path)
                .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;
            Ok(Arc::new(gw))
        }
        None => Ok(Arc::new(InMemoryRetrievalGateway::new())),
    }
}
