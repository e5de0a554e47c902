//! Echo 工具（测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{FieldSpec, FieldType, Tool, ToolSpec};

/// Echo 工具：回显文本
pub struct EchoTool {
    spec: ToolSpec,
}

impl EchoTool {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec::new("echo", "Echo text back unchanged (for testing).")
                .input(FieldSpec::required("text", FieldType::String, "text to echo"))
                .output(FieldSpec::required("text", FieldType::String, "the same text")),
        }
    }
}

impl Default for EchoTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let text = args.get("text").and_then(|v| v.as_str()).unwrap_or_default();
        Ok(Value::String(text.to_string()))
    }
}
