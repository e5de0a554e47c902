//! 工具调用 JSON Schema 生成（schemars）
//!
//! 将「合法 tool call」的 JSON 结构注入 system prompt，减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde_json::{Map, Value};

/// 工具调用格式：与协议解析的 `{"tool": "...", "args": {...}, "id": "..."}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名；保留名 retrieve / delegate / end_session 分别表示检索、委派、结束会话
    pub tool: String,
    /// 工具参数，字段由各工具的输入 schema 决定
    pub args: Map<String, Value>,
    /// 可选的 correlation id；缺省时由运行时生成
    pub id: Option<String>,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_names_call_fields() {
        let schema = tool_call_schema_json();
        assert!(schema.contains("\"tool\""));
        assert!(schema.contains("\"args\""));
        assert!(schema.contains("\"id\""));
    }
}
