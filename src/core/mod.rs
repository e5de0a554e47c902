//! 核心编排层：错误与恢复、会话监管、任务调度、运行时门面

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod task_scheduler;

pub use error::{AgentError, RecoveryAction, RunFailure};
pub use orchestrator::{create_model_from_config, Orchestrator, OrchestratorBuilder};
pub use recovery::RecoveryEngine;
pub use session_supervisor::{SessionLease, SessionSupervisor};
pub use task_scheduler::{TaskKind, TaskScheduler};
