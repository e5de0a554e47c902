//! Hive - Rust 智能体编排运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、会话监管、任务调度、运行时门面（Orchestrator）
//! - **llm**: 模型客户端抽象、线协议与实现（OpenAI 兼容 / DeepSeek / Mock / Scripted）
//! - **observability**: tracing 日志
//! - **react**: Planner 与编排主循环
//! - **retrieval**: 检索网关、查询流水线、结果合并、引用校验
//! - **session**: 会话模型与带版本的存储（内存 / SQLite）
//! - **supervisor**: 智能体描述、能力路由、人工审批
//! - **tools**: 工具契约、注册表、执行器与内置工具

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod react;
pub mod retrieval;
pub mod session;
pub mod supervisor;
pub mod tools;

pub use crate::core::{AgentError, Orchestrator, OrchestratorBuilder, RunFailure};
pub use crate::react::{FinalResponse, ReactEvent, Termination};
