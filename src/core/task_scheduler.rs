//! 任务调度：工具池与检索子查询池
//!
//! 同一 session 内的步骤严格串行（由 SessionSupervisor 保证）；工具调用与分解/扩展出的子查询
//! 可以并发执行，各自用 Semaphore 限制并发数。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::AgentError;

/// 任务类型
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TaskKind {
    /// 工具执行，受限并发
    ToolExecution,
    /// 检索子查询，受限并发
    RetrievalQuery,
}

/// 任务调度器
#[derive(Debug)]
pub struct TaskScheduler {
    tool_semaphore: Arc<Semaphore>,
    query_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize, max_concurrent_queries: usize) -> Self {
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools.max(1))),
            query_semaphore: Arc::new(Semaphore::new(max_concurrent_queries.max(1))),
        }
    }

    /// 获取工具执行许可
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit, AgentError> {
        self.acquire(TaskKind::ToolExecution).await
    }

    /// 获取检索子查询许可
    pub async fn acquire_query(&self) -> Result<OwnedSemaphorePermit, AgentError> {
        self.acquire(TaskKind::RetrievalQuery).await
    }

    pub async fn acquire(&self, kind: TaskKind) -> Result<OwnedSemaphorePermit, AgentError> {
        let semaphore = match kind {
            TaskKind::ToolExecution => &self.tool_semaphore,
            TaskKind::RetrievalQuery => &self.query_semaphore,
        };
        semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Cancelled(format!("{kind:?} pool closed")))
    }

    pub fn available(&self, kind: TaskKind) -> usize {
        match kind {
            TaskKind::ToolExecution => self.tool_semaphore.available_permits(),
            TaskKind::RetrievalQuery => self.query_semaphore.available_permits(),
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(3, 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_bounded() {
        let scheduler = TaskScheduler::new(1, 2);
        let permit = scheduler.acquire_tool().await.unwrap();
        assert_eq!(scheduler.available(TaskKind::ToolExecution), 0);
        assert_eq!(scheduler.available(TaskKind::RetrievalQuery), 2);
        drop(permit);
        assert_eq!(scheduler.available(TaskKind::ToolExecution), 1);
    }

    #[test]
    fn test_zero_is_clamped() {
        let scheduler = TaskScheduler::new(0, 0);
        assert_eq!(scheduler.available(TaskKind::ToolExecution), 1);
        assert_eq!(scheduler.available(TaskKind::RetrievalQuery), 1);
    }
}
