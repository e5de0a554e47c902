//! 智能体描述：能力集合、可用工具、需要人工审批的动作
//!
//! 从 config/agents.toml 的 `[[agent]]` 数组加载。

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// 可用工具名；为空表示注册表中的全部工具
    #[serde(default)]
    pub tools: Vec<String>,
    /// 执行前必须经人工审批的动作名
    #[serde(default)]
    pub requires_approval: Vec<String>,
    /// 覆盖基础系统提示
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            capabilities: Vec::new(),
            tools: Vec::new(),
            requires_approval: Vec::new(),
            system_prompt: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_approval<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires_approval = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn requires_approval(&self, action: &str) -> bool {
        self.requires_approval.iter().any(|a| a == action)
    }

    pub fn can_use(&self, tool: &str) -> bool {
        self.tools.is_empty() || self.tools.iter().any(|t| t == tool)
    }

    /// 小写化后的能力集合
    pub fn capability_set(&self) -> BTreeSet<String> {
        self.capabilities.iter().map(|c| c.trim().to_lowercase()).collect()
    }
}

#[derive(Debug, Deserialize)]
struct AgentsToml {
    #[serde(default, rename = "agent")]
    agents: Vec<AgentDescriptor>,
}

pub fn parse_agents(toml_content: &str) -> Result<Vec<AgentDescriptor>, AgentError> {
    let parsed: AgentsToml =
        toml::from_str(toml_content).map_err(|e| AgentError::Config(format!("agents file: {e}")))?;
    Ok(parsed.agents)
}

/// 读取并解析智能体描述文件
pub fn load_agents(path: &Path) -> Result<Vec<AgentDescriptor>, AgentError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;
    let agents = parse_agents(&content)?;
    tracing::info!(path = %path.display(), count = agents.len(), "agents loaded");
    Ok(agents)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENTS: &str = r#"
[[agent]]
id = "reservations"
description = "Creates and cancels restaurant bookings"
capabilities = ["bookings", "restaurant"]
tools = ["create_booking", "cancel_booking", "get_booking"]
requires_approval = ["cancel_booking"]

[[agent]]
id = "concierge"
capabilities = ["travel"]
"#;

    #[test]
    fn test_parse_agents_toml() {
        let agents = parse_agents(AGENTS).unwrap();
        assert_eq!(agents.len(), 2);
        assert!(agents[0].requires_approval("cancel_booking"));
        assert!(!agents[0].requires_approval("create_booking"));
        assert!(agents[0].can_use("get_booking"));
        assert!(!agents[0].can_use("echo"));
        assert!(agents[1].can_use("echo"));
        assert!(agents[1].description.is_empty());
    }

    #[test]
    fn test_load_agents_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.toml");
        std::fs::write(&path, AGENTS).unwrap();
        assert_eq!(load_agents(&path).unwrap()[1].id, "concierge");
        assert!(load_agents(&dir.path().join("missing.toml")).is_err());
        assert!(parse_agents("[[agent]]\ncapabilities = 3").is_err());
    }
}
