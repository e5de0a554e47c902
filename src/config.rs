//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=mock`）。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::tools::FieldSpec;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub retrieval: RetrievalSection,
    pub session: SessionSection,
    pub supervisor: SupervisorSection,
}

/// [app] 段：名称、系统提示、步数预算、上下文窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    pub system_prompt: String,
    /// 单次 run 的最大模型步数
    pub max_steps: usize,
    /// 送给模型的最近 turn 数上限（0 表示不截断）
    pub max_context_turns: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            system_prompt: default_system_prompt(),
            max_steps: 8,
            max_context_turns: 40,
        }
    }
}

fn default_system_prompt() -> String {
    "You are Hive, a helpful assistant. Use the declared tools when they help; \
     answer in plain text when you are done."
        .to_string()
}

/// [llm] 段：后端选择、超时与退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / deepseek / mock
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
    pub retry: RetrySection,
    pub embedding_model: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: None,
            base_url: None,
            request_timeout_secs: 60,
            retry: RetrySection::default(),
            embedding_model: "text-embedding-3-small".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

/// [tools] 段：超时、并发与插件
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub max_concurrent_tools: usize,
    /// 是否注册内置的预订工具
    pub bookings: bool,
    pub plugins: Vec<PluginEntry>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            max_concurrent_tools: 3,
            bookings: true,
            plugins: Vec::new(),
        }
    }
}

/// [[tools.plugins]]：外部程序 + 参数模板
#[derive(Debug, Clone, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub program: String,
    /// 参数模板，{{key}} 由调用参数替换
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub idempotent: bool,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// [retrieval] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    pub enabled: bool,
    /// HTTP 检索端点；为空时用进程内网关
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    /// 进程内网关的文档 JSON 文件
    pub documents: Option<PathBuf>,
    pub default_k: usize,
    pub stages: StagesSection,
    pub expansions: usize,
    pub allowed_topics: Vec<String>,
    pub blocked_topics: Vec<String>,
    pub synonyms: BTreeMap<String, String>,
    /// 引用校验：句子内容词被证据覆盖的最低比例
    pub citation_min_overlap: f32,
    pub max_concurrent_queries: usize,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            timeout_secs: 15,
            documents: None,
            default_k: 5,
            stages: StagesSection::default(),
            expansions: 2,
            allowed_topics: Vec::new(),
            blocked_topics: Vec::new(),
            synonyms: BTreeMap::new(),
            citation_min_overlap: 0.5,
            max_concurrent_queries: 4,
        }
    }
}

/// [retrieval.stages]：各阶段开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagesSection {
    pub classify: bool,
    pub normalize: bool,
    pub decompose: bool,
    pub expand: bool,
    pub hyde: bool,
}

impl Default for StagesSection {
    fn default() -> Self {
        Self {
            classify: true,
            normalize: true,
            decompose: true,
            expand: false,
            hyde: false,
        }
    }
}

/// [session] 段：存储后端与冲突重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// memory / sqlite
    pub backend: String,
    pub db_path: PathBuf,
    pub max_conflict_retries: u32,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            db_path: PathBuf::from("data/sessions.db"),
            max_conflict_retries: 3,
        }
    }
}

/// [supervisor] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// 智能体描述文件；未设置时依次查找 config/agents.toml、../config/agents.toml
    pub agents_file: Option<PathBuf>,
    /// 委派嵌套深度上限
    pub max_depth: usize,
    /// 等待审批决定的超时（秒）
    pub approval_wait_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            agents_file: None,
            max_depth: 2,
            approval_wait_secs: 300,
        }
    }
}

impl SupervisorSection {
    /// 实际使用的智能体描述文件
    pub fn resolve_agents_file(&self) -> Option<PathBuf> {
        if let Some(p) = &self.agents_file {
            return Some(p.clone());
        }
        ["config/agents.toml", "../config/agents.toml"]
            .into_iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
