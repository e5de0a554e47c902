//! 分词：检索打分与引用校验共用
//!
//! 含 CJK 字符时用 jieba-rs 分词，否则按非字母数字字符切分；统一小写。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "i", "in", "is",
    "it", "its", "me", "my", "of", "on", "or", "that", "the", "this", "to", "was", "were", "what",
    "which", "with", "you", "your", "的", "了", "是", "和", "在",
];

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |   // CJK Unified Ideographs
        '\u{3400}'..='\u{4DBF}' |   // Extension A
        '\u{F900}'..='\u{FAFF}' |   // Compatibility Ideographs
        '\u{3040}'..='\u{309F}' |   // Hiragana
        '\u{30A0}'..='\u{30FF}'     // Katakana
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 分词（保留顺序，不去停用词）
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| s.chars().any(|c| c.is_alphanumeric()))
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_lowercase())
            .collect()
    }
}

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// 去掉停用词后的词集合（用于打分与引用覆盖率）
pub fn content_tokens(text: &str) -> HashSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !is_stopword(t))
        .collect()
}

/// Jaccard 相似度
pub fn jaccard_similarity(set1: &HashSet<String>, set2: &HashSet<String>) -> f32 {
    if set1.is_empty() || set2.is_empty() {
        return 0.0;
    }
    let intersection = set1.intersection(set2).count() as f32;
    let union = set1.union(set2).count() as f32;
    intersection / union
}

/// needle 中有多大比例的词出现在 haystack 中
pub fn coverage(needle: &HashSet<String>, haystack: &HashSet<String>) -> f32 {
    if needle.is_empty() {
        return 0.0;
    }
    needle.intersection(haystack).count() as f32 / needle.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_chinese() {
        let tokens = tokenize("我喜欢编程和人工智能");
        assert!(tokens.iter().any(|t| t.contains("编程") || t.contains("智能")));
    }

    #[test]
    fn test_tokenize_strips_punctuation() {
        let tokens = tokenize("Paris, France: the best hotel?");
        assert_eq!(tokens, vec!["paris", "france", "the", "best", "hotel"]);
    }

    #[test]
    fn test_content_tokens_drop_stopwords() {
        let set = content_tokens("the best hotel in Paris");
        assert!(set.contains("hotel"));
        assert!(!set.contains("the"));
        assert!(!set.contains("in"));
    }

    #[test]
    fn test_similarity_measures() {
        let a = content_tokens("cheap hotel paris");
        let b = content_tokens("hotel in paris with pool");
        assert!(jaccard_similarity(&a, &b) > 0.0);
        assert!((coverage(&a, &b) - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(coverage(&HashSet::new(), &b), 0.0);
    }
}
