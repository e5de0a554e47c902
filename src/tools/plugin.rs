//! 插件工具：由配置 [[tools.plugins]] 注册，运行「程序 + 参数模板」实现动态扩展
//!
//! 参数模板中 {{key}} 从模型传入的 args 中取值（参数已按 fields 校验）；
//! 执行时无 shell，直接 exec program + substituted args，超时由 ToolRegistry 控制。

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::config::PluginEntry;
use crate::tools::{Tool, ToolSpec};

/// 从配置项构建的插件工具
pub struct PluginTool {
    spec: ToolSpec,
    program: String,
    args_template: Vec<String>,
    working_dir: Option<PathBuf>,
    idempotent: bool,
}

impl PluginTool {
    pub fn new(entry: &PluginEntry) -> Self {
        let spec = entry
            .fields
            .iter()
            .cloned()
            .fold(ToolSpec::new(&entry.name, &entry.description), ToolSpec::input);
        Self {
            spec,
            program: entry.program.clone(),
            args_template: entry.args.clone(),
            working_dir: entry.working_dir.clone(),
            idempotent: entry.idempotent,
        }
    }

    /// 替换模板中的 {{key}}；缺失的可选参数替换为空串
    fn substitute(&self, args: &Value) -> Vec<String> {
        let empty = serde_json::Map::new();
        let obj = args.as_object().unwrap_or(&empty);
        self.args_template
            .iter()
            .map(|tpl| {
                let mut s = tpl.clone();
                for (k, v) in obj {
                    let placeholder = format!("{{{{{}}}}}", k);
                    let val = match v {
                        Value::String(x) => x.clone(),
                        _ => v.to_string(),
                    };
                    s = s.replace(&placeholder, &val);
                }
                for field in &self.spec.input {
                    s = s.replace(&format!("{{{{{}}}}}", field.name), "");
                }
                s
            })
            .collect()
    }
}

#[async_trait]
impl Tool for PluginTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let argv = self.substitute(&args);
        tracing::info!(tool = %self.spec.name, program = %self.program, "plugin tool invoke");
        let mut cmd = Command::new(&self.program);
        cmd.args(&argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| format!("plugin spawn failed: {}", e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "exit {:?}: stderr {}",
                output.status.code(),
                stderr.trim()
            ));
        }
        Ok(Value::String(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FieldSpec, FieldType};
    use serde_json::json;

    fn echo_entry() -> PluginEntry {
        PluginEntry {
            name: "say".to_string(),
            description: "echo via /bin/echo".to_string(),
            program: "echo".to_string(),
            args: vec!["hello".to_string(), "{{who}}".to_string()],
            fields: vec![FieldSpec::required("who", FieldType::String, "name")],
            idempotent: true,
            working_dir: None,
        }
    }

    #[test]
    fn test_spec_from_entry() {
        let tool = PluginTool::new(&echo_entry());
        assert_eq!(tool.spec().name, "say");
        assert_eq!(tool.spec().input.len(), 1);
        assert!(tool.idempotent());
    }

    #[tokio::test]
    async fn test_runs_program_with_substituted_args() {
        let tool = PluginTool::new(&echo_entry());
        let out = tool.execute(json!({"who": "hive"})).await.unwrap();
        assert_eq!(out, json!("hello hive"));
    }

    #[tokio::test]
    async fn test_missing_program_is_error() {
        let mut entry = echo_entry();
        entry.program = "definitely-not-a-real-binary-xyz".to_string();
        let tool = PluginTool::new(&entry);
        assert!(tool.execute(json!({"who": "x"})).await.is_err());
    }
}
