//! 运行时门面
//!
//! 负责：按配置创建模型/工具/存储/检索/智能体路由，并为每次提交占用会话租约、
//! 加载带版本的会话、驱动编排循环、在步骤边界持久化。存储版本冲突时整次重试（有上限），
//! 但本次尝试已成功执行过非幂等调用时不重放，直接把冲突连同轨迹交给调用方。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, LlmSection};
use crate::core::{
    AgentError, RecoveryAction, RecoveryEngine, RunFailure, SessionLease, SessionSupervisor, TaskScheduler,
};
use crate::llm::{
    create_deepseek_client, create_embedder_from_config, Embedder, MockModelClient, ModelClient,
    OpenAiClient, RetryConfig, RetryingModelClient,
};
use crate::llm::protocol::{DELEGATE_TOOL, END_SESSION_TOOL, RETRIEVE_TOOL};
use crate::react::{
    Checkpoint, FinalResponse, Planner, ReactEvent, ReactSession, Termination, DEFAULT_MAX_STEPS,
};
use crate::retrieval::{
    create_gateway_from_config, CitationValidator, PipelineConfig, QueryPipeline, RetrievalGateway,
};
use crate::session::{
    create_session_store, MemorySessionStore, Session, SessionStore, TerminationReason, Turn,
};
use crate::supervisor::{
    load_agents, AgentDescriptor, ApprovalChannel, ApprovalDecision, CapabilityRouter,
    InMemoryApprovalChannel,
};
use crate::tools::{
    BookingBook, EchoTool, PluginTool, Tool, ToolErrorKind, ToolExecutor, ToolRegistry, ToolResult,
};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// 根据配置与环境变量选择模型后端（DeepSeek / OpenAI 兼容 / Mock），外层套上退避重试
pub fn create_model_from_config(cfg: &LlmSection) -> Arc<dyn ModelClient> {
    let provider = cfg.provider.to_lowercase();
    let timeout = Duration::from_secs(cfg.request_timeout_secs);
    let has_openai_key = std::env::var("OPENAI_API_KEY").is_ok();
    let has_deepseek_key = std::env::var("DEEPSEEK_API_KEY").is_ok();

    let inner: Arc<dyn ModelClient> = match provider.as_str() {
        "deepseek" if has_deepseek_key || has_openai_key => {
            let client = create_deepseek_client(cfg.model.as_deref(), timeout);
            tracing::info!(model = client.name(), "using DeepSeek model");
            Arc::new(client)
        }
        "openai" if has_openai_key => {
            let model = cfg.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            tracing::info!(%model, "using OpenAI-compatible model");
            Arc::new(OpenAiClient::new(cfg.base_url.as_deref(), &model, None).with_timeout(timeout))
        }
        "mock" => {
            tracing::info!("using mock model");
            Arc::new(MockModelClient)
        }
        other => {
            tracing::warn!(provider = other, "no API key set or provider unknown, using mock model");
            Arc::new(MockModelClient)
        }
    };

    let retry = RetryConfig {
        max_attempts: cfg.retry.max_attempts.max(1),
        initial_backoff: Duration::from_millis(cfg.retry.initial_backoff_ms),
        max_backoff: Duration::from_millis(cfg.retry.max_backoff_ms),
        ..RetryConfig::default()
    };
    Arc::new(RetryingModelClient::new(inner, retry))
}

/// 带期望版本写回存储的 checkpoint；每次成功保存后推进版本
struct StoreCheckpoint {
    store: Arc<dyn SessionStore>,
    version: AtomicU64,
}

impl StoreCheckpoint {
    fn new(store: Arc<dyn SessionStore>, version: u64) -> Self {
        Self {
            store,
            version: AtomicU64::new(version),
        }
    }
}

#[async_trait]
impl Checkpoint for StoreCheckpoint {
    async fn checkpoint(&self, session: &Session) -> Result<(), AgentError> {
        let expected = self.version.load(Ordering::SeqCst);
        let next = self.store.save(session, expected).await?;
        self.version.store(next, Ordering::SeqCst);
        tracing::debug!(session_id = %session.id, version = next, "session checkpointed");
        Ok(())
    }
}

/// Orchestrator 构建器：统一组装模型、工具、存储、检索与智能体
pub struct OrchestratorBuilder {
    model: Arc<dyn ModelClient>,
    system_prompt: String,
    tools: Vec<Arc<dyn Tool>>,
    tool_timeout: Duration,
    store: Option<Arc<dyn SessionStore>>,
    approvals: Option<Arc<dyn ApprovalChannel>>,
    agents: Vec<AgentDescriptor>,
    retrieval: Option<(Arc<dyn RetrievalGateway>, PipelineConfig)>,
    embedder: Option<Arc<dyn Embedder>>,
    citation_min_overlap: Option<f32>,
    scheduler: Option<Arc<TaskScheduler>>,
    max_steps: usize,
    max_context_turns: usize,
    max_depth: usize,
    max_conflict_retries: u32,
    approval_wait: Duration,
    streaming: bool,
}

impl OrchestratorBuilder {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self {
            model,
            system_prompt: "You are Hive, a helpful assistant.".to_string(),
            tools: Vec::new(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            store: None,
            approvals: None,
            agents: Vec::new(),
            retrieval: None,
            embedder: None,
            citation_min_overlap: None,
            scheduler: None,
            max_steps: DEFAULT_MAX_STEPS,
            max_context_turns: 0,
            max_depth: 2,
            max_conflict_retries: 3,
            approval_wait: Duration::from_secs(300),
            streaming: false,
        }
    }

    /// 按 AppConfig 组装：内置工具、插件、存储后端、智能体描述文件、检索
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let model = create_model_from_config(&cfg.llm);
        let mut builder = Self::new(model)
            .system_prompt(&cfg.app.system_prompt)
            .max_steps(cfg.app.max_steps)
            .max_context_turns(cfg.app.max_context_turns)
            .max_depth(cfg.supervisor.max_depth)
            .max_conflict_retries(cfg.session.max_conflict_retries)
            .approval_wait(Duration::from_secs(cfg.supervisor.approval_wait_secs))
            .tool_timeout(Duration::from_secs(cfg.tools.tool_timeout_secs))
            .scheduler(Arc::new(TaskScheduler::new(
                cfg.tools.max_concurrent_tools,
                cfg.retrieval.max_concurrent_queries,
            )))
            .store(create_session_store(&cfg.session)?)
            .tool(EchoTool::new());

        if cfg.tools.bookings {
            for tool in BookingBook::new().tools() {
                builder = builder.tool_arc(tool);
            }
        }
        for entry in &cfg.tools.plugins {
            tracing::info!(plugin = %entry.name, program = %entry.program, "registering plugin tool");
            builder = builder.tool(PluginTool::new(entry));
        }

        if let Some(path) = cfg.supervisor.resolve_agents_file() {
            let agents = load_agents(&path)?;
            tracing::info!(path = %path.display(), count = agents.len(), "agents loaded");
            builder = builder.agents(agents);
        }

        if cfg.retrieval.enabled {
            let gateway = create_gateway_from_config(&cfg.retrieval)?;
            let embedder =
                create_embedder_from_config(cfg.llm.base_url.as_deref(), &cfg.llm.embedding_model, None);
            builder = builder
                .retrieval(gateway, PipelineConfig::from(&cfg.retrieval))
                .embedder(embedder)
                .citation(cfg.retrieval.citation_min_overlap);
        }
        Ok(builder)
    }

    pub fn system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    pub fn tool(self, tool: impl Tool + 'static) -> Self {
        self.tool_arc(Arc::new(tool))
    }

    pub fn tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn approvals(mut self, channel: Arc<dyn ApprovalChannel>) -> Self {
        self.approvals = Some(channel);
        self
    }

    pub fn agent(mut self, agent: AgentDescriptor) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn agents(mut self, agents: Vec<AgentDescriptor>) -> Self {
        self.agents.extend(agents);
        self
    }

    pub fn retrieval(mut self, gateway: Arc<dyn RetrievalGateway>, config: PipelineConfig) -> Self {
        self.retrieval = Some((gateway, config));
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// 开启引用校验（句子内容词的最低证据覆盖率）
    pub fn citation(mut self, min_overlap: f32) -> Self {
        self.citation_min_overlap = Some(min_overlap);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn max_context_turns(mut self, turns: usize) -> Self {
        self.max_context_turns = turns;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn approval_wait(mut self, wait: Duration) -> Self {
        self.approval_wait = wait;
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// 启动期校验（工具 spec、保留名、智能体 id）在这里一次性完成
    pub fn build(self) -> Result<Orchestrator, AgentError> {
        let scheduler = self.scheduler.unwrap_or_default();

        let mut registry = ToolRegistry::new(self.tool_timeout);
        for tool in self.tools {
            registry.register_arc(tool)?;
        }
        tracing::info!(tools = ?registry.tool_names(), "tool registry ready");

        let router = CapabilityRouter::from_agents(self.agents)?;
        let embedder = self.embedder;
        let model = self.model;
        let pipeline = self.retrieval.map(|(gateway, config)| {
            let pipeline = QueryPipeline::new(gateway, config, scheduler.clone()).with_model(model.clone());
            match &embedder {
                Some(e) => pipeline.with_embedder(e.clone()),
                None => pipeline,
            }
        });
        let validator = self
            .citation_min_overlap
            .map(|min| CitationValidator::new(min).with_model(model.clone()));

        Ok(Orchestrator {
            planner: Planner::new(model, self.system_prompt).with_max_context_turns(self.max_context_turns),
            executor: ToolExecutor::new(Arc::new(registry), scheduler),
            recovery: RecoveryEngine::new(),
            supervisor: SessionSupervisor::new(),
            store: self.store.unwrap_or_else(|| Arc::new(MemorySessionStore::new())),
            approvals: self
                .approvals
                .unwrap_or_else(|| Arc::new(InMemoryApprovalChannel::new())),
            router,
            pipeline,
            validator,
            max_steps: self.max_steps,
            max_depth: self.max_depth,
            max_conflict_retries: self.max_conflict_retries,
            approval_wait: self.approval_wait,
            streaming: self.streaming,
        })
    }
}

/// 多会话运行时：每个会话同一时刻一个在途循环，不同会话互不影响
pub struct Orchestrator {
    planner: Planner,
    executor: ToolExecutor,
    recovery: RecoveryEngine,
    supervisor: SessionSupervisor,
    store: Arc<dyn SessionStore>,
    approvals: Arc<dyn ApprovalChannel>,
    router: CapabilityRouter,
    pipeline: Option<QueryPipeline>,
    validator: Option<CitationValidator>,
    max_steps: usize,
    max_depth: usize,
    max_conflict_retries: u32,
    approval_wait: Duration,
    streaming: bool,
}

impl Orchestrator {
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        OrchestratorBuilder::from_config(cfg)?.build()
    }

    pub fn router(&self) -> &CapabilityRouter {
        &self.router
    }

    pub fn approvals(&self) -> Arc<dyn ApprovalChannel> {
        self.approvals.clone()
    }

    pub async fn submit(&self, session_id: &str, input: &str) -> Result<FinalResponse, RunFailure> {
        self.submit_with_events(session_id, input, None).await
    }

    /// 向会话提交一条用户输入并运行到终止；会话不存在时创建
    pub async fn submit_with_events(
        &self,
        session_id: &str,
        input: &str,
        events: Option<&UnboundedSender<ReactEvent>>,
    ) -> Result<FinalResponse, RunFailure> {
        let lease = self.supervisor.begin(session_id)?;
        let mut attempt = 0u32;
        loop {
            let (mut session, version) = self.load_or_create(session_id).await?;
            let loaded = session.turns().len();
            let checkpoint = StoreCheckpoint::new(self.store.clone(), version);
            let react = self.react_session(lease.token(), &checkpoint, events);
            let outcome = react.run(&mut session, input).await;
            match self.settle(outcome, &session, &checkpoint).await {
                Err(failure)
                    if self.recovery.handle(&failure.error) == RecoveryAction::RetryStep
                        && attempt < self.max_conflict_retries =>
                {
                    let committed = self.committed_side_effects(&session.turns()[loaded..]);
                    if !committed.is_empty() {
                        tracing::error!(
                            session_id,
                            tools = ?committed,
                            error = %failure.error,
                            "version conflict after non-idempotent calls, not replaying run"
                        );
                        return Err(failure);
                    }
                    attempt += 1;
                    tracing::warn!(session_id, attempt, error = %failure.error, "version conflict, retrying run");
                }
                other => return other,
            }
        }
    }

    pub async fn resume(&self, session_id: &str, decision: ApprovalDecision) -> Result<FinalResponse, RunFailure> {
        self.resume_with_events(session_id, decision, None).await
    }

    /// 用审批决定恢复挂起的会话
    pub async fn resume_with_events(
        &self,
        session_id: &str,
        decision: ApprovalDecision,
        events: Option<&UnboundedSender<ReactEvent>>,
    ) -> Result<FinalResponse, RunFailure> {
        let lease = self.supervisor.begin(session_id)?;
        self.resume_leased(&lease, decision, events).await
    }

    /// 在审批通道上等待该会话挂起请求的决定（有超时），拿到后恢复
    ///
    /// 等待期间持有会话租约，cancel(session_id) 会中断等待并以取消终止会话；
    /// 超时则会话保持挂起，之后的决定仍可恢复它。
    pub async fn await_decision(
        &self,
        session_id: &str,
        events: Option<&UnboundedSender<ReactEvent>>,
    ) -> Result<FinalResponse, RunFailure> {
        let lease = self.supervisor.begin(session_id)?;
        let session = self
            .session(session_id)
            .await?
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        let pending = session
            .pending_approval
            .ok_or_else(|| AgentError::NoPendingApproval(session_id.to_string()))?;
        let correlation_id = pending.request.correlation_id;
        let token = lease.token();
        let decision = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::info!(session_id, %correlation_id, "approval wait cancelled");
                return self.cancel_suspended(session_id).await;
            }
            waited = tokio::time::timeout(self.approval_wait, self.approvals.wait_decision(&correlation_id)) => {
                waited.map_err(|_| AgentError::Cancelled(format!("approval {correlation_id} timed out")))??
            }
        };
        self.resume_leased(&lease, decision, events).await
    }

    /// 中断该会话的在途循环
    pub fn cancel(&self, session_id: &str) -> bool {
        self.supervisor.cancel(session_id)
    }

    /// 调用方发出的结束信号：终止会话并持久化
    pub async fn end_session(&self, session_id: &str) -> Result<(), AgentError> {
        let _lease = self.supervisor.begin(session_id)?;
        let (mut session, version) = self
            .store
            .load(session_id)
            .await?
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        if session.is_terminated() {
            return Ok(());
        }
        session.terminate(TerminationReason::EndSignal);
        self.store.save(&session, version).await?;
        tracing::info!(session_id, "session ended by caller");
        Ok(())
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<Session>, AgentError> {
        Ok(self.store.load(session_id).await?.map(|(s, _)| s))
    }

    /// 进程关闭：取消全部在途会话
    pub fn shutdown(&self) {
        self.supervisor.shutdown();
    }

    async fn resume_leased(
        &self,
        lease: &SessionLease,
        decision: ApprovalDecision,
        events: Option<&UnboundedSender<ReactEvent>>,
    ) -> Result<FinalResponse, RunFailure> {
        let session_id = lease.session_id();
        let (mut session, version) = self
            .store
            .load(session_id)
            .await
            .map_err(AgentError::from)?
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        let checkpoint = StoreCheckpoint::new(self.store.clone(), version);
        let react = self.react_session(lease.token(), &checkpoint, events);
        let outcome = react.resume(&mut session, decision).await;
        self.settle(outcome, &session, &checkpoint).await
    }

    /// 等待审批时被取消：挂起的调用记为取消，会话以取消原因终止
    async fn cancel_suspended(&self, session_id: &str) -> Result<FinalResponse, RunFailure> {
        let (mut session, version) = self
            .store
            .load(session_id)
            .await
            .map_err(AgentError::from)?
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        if let Some(pending) = session.pending_approval.take() {
            session.push(Turn::tool_result(ToolResult::failure(
                &pending.call,
                ToolErrorKind::Execution,
                "cancelled while awaiting approval",
            )));
        }
        session.terminate(TerminationReason::Cancelled);
        self.store
            .save(&session, version)
            .await
            .map_err(|e| RunFailure::new(e.into(), session.turns().to_vec()))?;
        Ok(FinalResponse {
            session_id: session.id.clone(),
            text: "Cancelled.".to_string(),
            termination: Termination::Cancelled,
            steps: 0,
            validation: None,
        })
    }

    /// 本次尝试中已成功执行、重放会再次执行的调用
    fn committed_side_effects<'t>(&self, turns: &'t [Turn]) -> Vec<&'t str> {
        turns
            .iter()
            .filter_map(Turn::as_tool_result)
            .filter(|r| r.success && !self.replay_safe(&r.tool))
            .map(|r| r.tool.as_str())
            .collect()
    }

    fn replay_safe(&self, tool: &str) -> bool {
        match tool {
            RETRIEVE_TOOL | END_SESSION_TOOL => true,
            // 子智能体内部可能执行过任意工具
            DELEGATE_TOOL => false,
            name => self.executor.registry().is_idempotent(name),
        }
    }

    fn react_session<'a>(
        &'a self,
        token: CancellationToken,
        checkpoint: &'a StoreCheckpoint,
        events: Option<&'a UnboundedSender<ReactEvent>>,
    ) -> ReactSession<'a> {
        let mut react = ReactSession::new(&self.planner, &self.executor, &self.recovery, token)
            .with_max_steps(self.max_steps)
            .with_max_depth(self.max_depth)
            .with_streaming(self.streaming)
            .with_router(&self.router)
            .with_approvals(self.approvals.as_ref())
            .with_checkpoint(checkpoint);
        if let Some(pipeline) = &self.pipeline {
            react = react.with_pipeline(pipeline);
        }
        if let Some(validator) = &self.validator {
            react = react.with_validator(validator);
        }
        if let Some(tx) = events {
            react = react.with_event_tx(tx);
        }
        react
    }

    async fn load_or_create(&self, session_id: &str) -> Result<(Session, u64), AgentError> {
        match self.store.load(session_id).await? {
            Some(found) => Ok(found),
            None => {
                tracing::info!(session_id, "creating session");
                Ok((Session::new(session_id), 0))
            }
        }
    }

    /// run 正常结束后保存终态；失败原样返回
    async fn settle(
        &self,
        outcome: Result<FinalResponse, RunFailure>,
        session: &Session,
        checkpoint: &StoreCheckpoint,
    ) -> Result<FinalResponse, RunFailure> {
        let response = outcome?;
        checkpoint
            .checkpoint(session)
            .await
            .map_err(|e| RunFailure::new(e, session.turns().to_vec()))?;
        Ok(response)
    }
}
