//! 模型线协议：system prompt 渲染与输出解析
//!
//! 模型以纯文本或 JSON 工具调用 `{"tool": "...", "args": {...}, "id": "..."}`（也可以是数组）回复。
//! 保留工具名：retrieve（检索意图）、delegate（委派意图）、end_session（结束会话）。

use std::collections::BTreeMap;

use serde_json::Value;

use crate::llm::ModelResponse;
use crate::tools::{
    new_correlation_id, tool_call_schema_json, FieldSpec, FieldType, ToolCallRequest, ToolSpec,
};

pub const RETRIEVE_TOOL: &str = "retrieve";
pub const DELEGATE_TOOL: &str = "delegate";
pub const END_SESSION_TOOL: &str = "end_session";

pub fn retrieve_spec() -> ToolSpec {
    ToolSpec::new(
        RETRIEVE_TOOL,
        "Search the knowledge base. Returns ranked evidence passages with source ids.",
    )
    .input(FieldSpec::required("query", FieldType::String, "what to look up"))
    .input(FieldSpec::optional("k", FieldType::Integer, "max passages to return"))
    .input(FieldSpec::optional("filters", FieldType::Object, "metadata filters"))
}

pub fn delegate_spec() -> ToolSpec {
    ToolSpec::new(
        DELEGATE_TOOL,
        "Hand a sub-task to a specialised agent. Returns that agent's final answer.",
    )
    .input(FieldSpec::required("task", FieldType::String, "the sub-task, in full"))
    .input(FieldSpec::optional("action", FieldType::String, "the action the agent should perform, e.g. cancel_booking"))
    .input(FieldSpec::optional("capabilities", FieldType::Array, "capabilities the task needs"))
    .input(FieldSpec::optional("agent_id", FieldType::String, "a specific agent id"))
}

pub fn end_session_spec() -> ToolSpec {
    ToolSpec::new(END_SESSION_TOOL, "End the conversation. Use only when the user is done.")
        .input(FieldSpec::optional("message", FieldType::String, "closing message for the user"))
}

/// 拼接 system prompt：基础提示 + 可用工具 schema + 会话属性 + 调用格式
pub fn render_system_prompt(
    base: &str,
    tool_specs: &[ToolSpec],
    attributes: &BTreeMap<String, String>,
) -> String {
    let mut out = String::from(base.trim());
    if !tool_specs.is_empty() {
        let tools: Vec<Value> = tool_specs.iter().map(|s| s.to_json_schema()).collect();
        out.push_str("\n\n## Tools\n");
        out.push_str(&serde_json::to_string_pretty(&tools).unwrap_or_default());
        out.push_str(
            "\n\nTo call a tool, reply with ONLY a JSON object matching this schema \
             (or a JSON array of them). Otherwise reply in plain text; plain text ends your turn.\n",
        );
        out.push_str(&tool_call_schema_json());
    }
    if !attributes.is_empty() {
        out.push_str("\n\n## Session attributes\n");
        for (k, v) in attributes {
            out.push_str(&format!("- {k}: {v}\n"));
        }
    }
    out
}

/// 解析模型输出；同时含文本与工具调用时两者都保留，由循环优先处理工具调用
pub fn parse_model_output(raw: &str) -> ModelResponse {
    let trimmed = raw.trim();
    let (calls, rest) = extract_tool_calls(trimmed);
    let text = rest.trim();
    ModelResponse {
        text: (!text.is_empty()).then(|| text.to_string()),
        tool_calls: calls,
        raw: raw.to_string(),
    }
}

/// 依次扫描文本中的 JSON 值（含 ```json 代码块），收集带 "tool" 键的对象；返回剩余文本
fn extract_tool_calls(input: &str) -> (Vec<ToolCallRequest>, String) {
    let mut calls = Vec::new();
    let mut rest = String::new();
    let mut i = 0;
    while i < input.len() {
        let Some(offset) = input[i..].find(['{', '[']) else {
            rest.push_str(&input[i..]);
            break;
        };
        let start = i + offset;
        rest.push_str(&input[i..start]);
        let mut de = serde_json::Deserializer::from_str(&input[start..]).into_iter::<Value>();
        match de.next() {
            Some(Ok(value)) => {
                let end = start + de.byte_offset();
                let found = calls_from_value(&value);
                if found.is_empty() {
                    rest.push_str(&input[start..end]);
                } else {
                    calls.extend(found);
                }
                i = end;
            }
            _ => {
                let ch_len = input[start..].chars().next().map(char::len_utf8).unwrap_or(1);
                rest.push_str(&input[start..start + ch_len]);
                i = start + ch_len;
            }
        }
    }
    (calls, strip_code_fences(&rest))
}

fn calls_from_value(value: &Value) -> Vec<ToolCallRequest> {
    match value {
        Value::Object(map) => {
            let Some(tool) = map.get("tool").and_then(|t| t.as_str()).filter(|t| !t.is_empty()) else {
                return Vec::new();
            };
            let id = map
                .get("id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(new_correlation_id);
            vec![ToolCallRequest {
                id,
                tool: tool.to_string(),
                args: map.get("args").cloned().unwrap_or(Value::Null),
            }]
        }
        Value::Array(items) => {
            let calls: Vec<ToolCallRequest> = items.iter().flat_map(calls_from_value).collect();
            // 数组里混有非调用元素时整体当作文本
            if calls.len() == items.len() {
                calls
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    }
}

fn strip_code_fences(text: &str) -> String {
    text.replace("```json", "").replace("```", "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_text() {
        let r = parse_model_output("Your table is booked.");
        assert!(r.tool_calls.is_empty());
        assert_eq!(r.text.as_deref(), Some("Your table is booked."));
    }

    #[test]
    fn test_single_call_with_id() {
        let r = parse_model_output(r#"{"tool": "create_booking", "args": {"guests": 2, "time": "19:00"}, "id": "c-1"}"#);
        assert_eq!(r.tool_calls.len(), 1);
        assert_eq!(r.tool_calls[0].id, "c-1");
        assert_eq!(r.tool_calls[0].args, json!({"guests": 2, "time": "19:00"}));
        assert!(r.text.is_none());
    }

    #[test]
    fn test_mixed_text_and_call_keeps_both() {
        let r = parse_model_output(
            "Let me book that.\n```json\n{\"tool\": \"create_booking\", \"args\": {\"guests\": 2}}\n```",
        );
        assert_eq!(r.tool_calls.len(), 1);
        assert!(r.tool_calls[0].id.starts_with("call_"));
        assert_eq!(r.text.as_deref(), Some("Let me book that."));
    }

    #[test]
    fn test_array_of_calls() {
        let r = parse_model_output(r#"[{"tool": "echo", "args": {"text": "a"}}, {"tool": "echo", "args": {"text": "b"}}]"#);
        assert_eq!(r.tool_calls.len(), 2);
        assert_ne!(r.tool_calls[0].id, r.tool_calls[1].id);
    }

    #[test]
    fn test_json_without_tool_and_broken_json_stay_text() {
        let r = parse_model_output(r#"The result is {"price": 10}."#);
        assert!(r.tool_calls.is_empty());
        assert_eq!(r.text.as_deref(), Some(r#"The result is {"price": 10}."#));

        let r = parse_model_output(r#"{"tool": "echo", "args": "#);
        assert!(r.tool_calls.is_empty());
        assert!(r.text.is_some());
    }

    #[test]
    fn test_prompt_lists_tools_and_attributes() {
        let mut attrs = BTreeMap::new();
        attrs.insert("restaurant".to_string(), "Luigi's".to_string());
        let prompt = render_system_prompt("You are helpful.", &[retrieve_spec()], &attrs);
        assert!(prompt.starts_with("You are helpful."));
        assert!(prompt.contains("\"retrieve\""));
        assert!(prompt.contains("- restaurant: Luigi's"));
    }
}
