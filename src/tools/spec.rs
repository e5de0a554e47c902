//! 工具描述与参数校验
//!
//! ToolSpec 声明输入/输出字段（名称、类型、是否必填）；调用前按输入 schema 做类型与必填检查，
//! 注册时做启动期检查（名称合法、字段不重复）。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 字段类型（与 JSON 类型对应）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, field_type: FieldType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            description: description.into(),
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            description: description.into(),
        }
    }
}

/// 参数校验失败的具体原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    #[error("arguments must be a JSON object, got {0}")]
    NotAnObject(String),
    #[error("missing required field `{0}`")]
    MissingField(String),
    #[error("field `{field}` expects {expected}, got {found}")]
    WrongType {
        field: String,
        expected: FieldType,
        found: String,
    },
    #[error("unknown field `{0}`")]
    UnknownField(String),
}

/// 工具描述：名称（唯一键）、描述、输入 / 输出字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub input: Vec<FieldSpec>,
    #[serde(default)]
    pub output: Vec<FieldSpec>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input: Vec::new(),
            output: Vec::new(),
        }
    }

    pub fn input(mut self, field: FieldSpec) -> Self {
        self.input.push(field);
        self
    }

    pub fn output(mut self, field: FieldSpec) -> Self {
        self.output.push(field);
        self
    }

    /// 按输入 schema 校验参数；null 视为空对象
    pub fn validate_args(&self, args: &Value) -> Result<(), SchemaViolation> {
        let empty = serde_json::Map::new();
        let obj = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => return Err(SchemaViolation::NotAnObject(json_type_name(other).to_string())),
        };

        for field in &self.input {
            match obj.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(SchemaViolation::MissingField(field.name.clone()));
                }
                None | Some(Value::Null) => {}
                Some(v) if !field.field_type.matches(v) => {
                    return Err(SchemaViolation::WrongType {
                        field: field.name.clone(),
                        expected: field.field_type,
                        found: json_type_name(v).to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        if let Some(unknown) = obj.keys().find(|k| !self.input.iter().any(|f| &f.name == *k)) {
            return Err(SchemaViolation::UnknownField(unknown.clone()));
        }
        Ok(())
    }

    /// 启动期检查：名称非空且只含 [a-z0-9_]，字段名非空且不重复
    pub fn check(&self) -> Result<(), String> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(format!("invalid tool name `{}`", self.name));
        }
        for (label, fields) in [("input", &self.input), ("output", &self.output)] {
            for (i, f) in fields.iter().enumerate() {
                if f.name.trim().is_empty() {
                    return Err(format!("tool `{}` has an unnamed {label} field", self.name));
                }
                if fields[..i].iter().any(|prev| prev.name == f.name) {
                    return Err(format!(
                        "tool `{}` declares {label} field `{}` twice",
                        self.name, f.name
                    ));
                }
            }
        }
        Ok(())
    }

    /// 输入 schema 转为 JSON Schema（拼入 system prompt）
    pub fn to_json_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .input
            .iter()
            .map(|f| {
                (
                    f.name.clone(),
                    serde_json::json!({ "type": f.field_type.as_str(), "description": f.description }),
                )
            })
            .collect();
        let required: Vec<&str> = self
            .input
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }
}
