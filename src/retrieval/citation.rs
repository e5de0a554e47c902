//! 引用自校验：基于检索证据起草的答案，每个断言句都必须能追溯到至少一段证据
//!
//! 不被支持的句子触发一次收紧提示的重写；仍不被支持的句子标记为低置信度，而不是悄悄保留。

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::llm::{ModelClient, ModelRequest};
use crate::retrieval::tokenizer::{content_tokens, coverage};
use crate::retrieval::RetrievalHit;
use crate::session::Turn;

pub const LOW_CONFIDENCE_MARKER: &str = "[unverified]";

static BOUNDARY_RE: OnceLock<Regex> = OnceLock::new();

/// 句末标点后接空白或结尾才算断句；中文标点直接断句；换行总是断句
fn boundary_re() -> &'static Regex {
    BOUNDARY_RE.get_or_init(|| Regex::new(r"[.!?]+(?:\s+|$)|[。！？]+\s*|\s*\n\s*").unwrap())
}

/// 以 "." 结尾但不结束句子的缩写
const ABBREVIATIONS: &[&str] = &["dr.", "mr.", "mrs.", "ms.", "st.", "vs.", "e.g.", "i.e.", "etc.", "approx."];

fn ends_with_abbreviation(text: &str) -> bool {
    text.rsplit(char::is_whitespace)
        .next()
        .is_some_and(|word| ABBREVIATIONS.contains(&word.to_lowercase().as_str()))
}

/// 切成 (句子, 句后原始分隔符)，拼回时保留原有空白与换行
fn segments(text: &str) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    let mut start = 0;
    for m in boundary_re().find_iter(text) {
        let matched = m.as_str();
        let punct = matched.len() - matched.trim_start_matches(|c: char| !c.is_whitespace()).len();
        let end = m.start() + punct;
        let sentence = text[start..end].trim();
        if matched.starts_with('.') && ends_with_abbreviation(sentence) {
            continue;
        }
        let separator = &text[end..m.end()];
        if sentence.is_empty() {
            if let Some(last) = out.last_mut() {
                last.1.push_str(separator);
            }
        } else {
            out.push((sentence.to_string(), separator.to_string()));
        }
        start = m.end();
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        out.push((rest.to_string(), String::new()));
    }
    out
}

pub fn split_sentences(text: &str) -> Vec<String> {
    segments(text).into_iter().map(|(s, _)| s).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentenceCheck {
    pub text: String,
    pub supported: bool,
    /// 支持该句的证据来源
    pub sources: Vec<String>,
    pub coverage: f32,
    /// 句后原始分隔符（空白 / 换行）
    #[serde(skip)]
    pub separator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CitationReport {
    pub sentences: Vec<SentenceCheck>,
    /// 是否做过一次重写
    pub regenerated: bool,
}

impl CitationReport {
    pub fn all_supported(&self) -> bool {
        self.sentences.iter().all(|s| s.supported)
    }

    pub fn unsupported(&self) -> impl Iterator<Item = &SentenceCheck> {
        self.sentences.iter().filter(|s| !s.supported)
    }

    /// 渲染最终答案：不被支持的句子加低置信度标记
    pub fn render(&self) -> String {
        self.sentences
            .iter()
            .map(|s| {
                if s.supported {
                    format!("{}{}", s.text, s.separator)
                } else {
                    format!("{LOW_CONFIDENCE_MARKER} {}{}", s.text, s.separator)
                }
            })
            .collect()
    }
}

pub struct CitationValidator {
    /// 句子内容词被单段证据覆盖的最低比例
    min_overlap: f32,
    model: Option<Arc<dyn ModelClient>>,
}

impl CitationValidator {
    pub fn new(min_overlap: f32) -> Self {
        Self {
            min_overlap: min_overlap.clamp(0.0, 1.0),
            model: None,
        }
    }

    /// 提供模型后才会尝试重写
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    /// 只做校验，不重写
    pub fn check(&self, answer: &str, evidence: &[RetrievalHit]) -> CitationReport {
        let evidence_tokens: Vec<_> = evidence
            .iter()
            .map(|h| (h.source_id.as_str(), content_tokens(&h.content)))
            .collect();
        let sentences = segments(answer)
            .into_iter()
            .map(|(text, separator)| {
                let tokens = content_tokens(&text);
                if tokens.is_empty() {
                    // 无实义内容（如 "Sure."）不算断言
                    return SentenceCheck {
                        text,
                        supported: true,
                        sources: Vec::new(),
                        coverage: 1.0,
                        separator,
                    };
                }
                let mut best = 0.0f32;
                let mut sources = Vec::new();
                for (source, ev) in &evidence_tokens {
                    let c = coverage(&tokens, ev);
                    best = best.max(c);
                    if c >= self.min_overlap && !sources.iter().any(|s: &String| s == source) {
                        sources.push(source.to_string());
                    }
                }
                SentenceCheck {
                    text,
                    supported: !sources.is_empty(),
                    sources,
                    coverage: best,
                    separator,
                }
            })
            .collect();
        CitationReport {
            sentences,
            regenerated: false,
        }
    }

    /// 校验；有不被支持的句子时至多重写一次，再次校验后残留的句子标记低置信度
    pub async fn validate(
        &self,
        question: &str,
        answer: &str,
        evidence: &[RetrievalHit],
        cancel: &CancellationToken,
    ) -> CitationReport {
        let report = self.check(answer, evidence);
        if report.all_supported() || evidence.is_empty() {
            return report;
        }
        let Some(model) = &self.model else {
            return report;
        };

        let unsupported: Vec<&str> = report.unsupported().map(|s| s.text.as_str()).collect();
        tracing::info!(count = unsupported.len(), "unsupported sentences, regenerating once");
        let evidence_block = evidence
            .iter()
            .map(|h| format!("[{}] {}", h.source_id, h.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Question: {question}\n\nEvidence:\n{evidence_block}\n\nDraft answer:\n{answer}\n\n\
             These sentences are not supported by the evidence:\n- {}\n\n\
             Rewrite the answer using ONLY facts stated in the evidence. Drop anything the evidence does not state.",
            unsupported.join("\n- ")
        );
        let request = ModelRequest {
            system_prompt: "You answer strictly from the given evidence. Reply in plain text.".to_string(),
            history: vec![Turn::user(prompt)],
            ..Default::default()
        };
        let regenerated = tokio::select! {
            biased;
            _ = cancel.cancelled() => return report,
            r = model.invoke(&request) => r,
        };
        match regenerated {
            Ok(r) => {
                let text = r.text.unwrap_or(r.raw);
                let mut second = self.check(&text, evidence);
                second.regenerated = true;
                second
            }
            Err(e) => {
                tracing::warn!(error = %e, "citation regeneration failed, flagging draft");
                report
            }
        }
    }
}
