//! 编排主循环
//!
//! 每步：组装上下文（历史 + 属性 + 工具描述）-> 调用模型 -> 解释输出。
//! 纯文本终止；工具调用（优先于同一回复里的文本）先校验再执行，结果写回后继续；
//! `retrieve` 走检索流水线，`delegate` 交给按能力路由的嵌套循环，`end_session` 结束会话。
//! 需审批的动作在顶层挂起（先 checkpoint 再发出请求），只由外部 ApprovalDecision 恢复。
//! 步数耗尽返回降级答复与 StepBudgetExceeded 标记。

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, RecoveryAction, RecoveryEngine, RunFailure};
use crate::llm::protocol::{
    delegate_spec, end_session_spec, retrieve_spec, DELEGATE_TOOL, END_SESSION_TOOL, RETRIEVE_TOOL,
};
use crate::llm::ModelError;
use crate::react::{Planner, ReactEvent};
use crate::retrieval::{
    merge_results, CitationReport, CitationValidator, PipelineOutcome, QueryPipeline,
    RetrievalError, RetrievalHit,
};
use crate::session::{Role, Session, SessionStatus, TerminationReason, Turn};
use crate::supervisor::{
    AgentDescriptor, ApprovalChannel, ApprovalDecision, ApprovalRequest, CapabilityRouter,
    DelegationRequest, PendingApproval,
};
use crate::tools::{new_correlation_id, ToolCallRequest, ToolErrorKind, ToolExecutor, ToolResult, ToolSpec};

/// 单次 run 的默认最大模型步数
pub const DEFAULT_MAX_STEPS: usize = 8;
const DEFAULT_MAX_DEPTH: usize = 2;
/// 流式回复时每段字符数
const CHUNK_CHARS: usize = 6;
/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 步骤边界的持久化钩子
#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn checkpoint(&self, session: &Session) -> Result<(), AgentError>;
}

/// 本次 run 的结束方式
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Completed,
    EndSignal,
    StepBudgetExceeded,
    Cancelled,
    /// 已挂起，等待外部审批
    AwaitingApproval(ApprovalRequest),
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::EndSignal => "end_signal",
            Self::StepBudgetExceeded => "step_budget_exceeded",
            Self::Cancelled => "cancelled",
            Self::AwaitingApproval(_) => "awaiting_approval",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FinalResponse {
    pub session_id: String,
    pub text: String,
    pub termination: Termination,
    /// 本次 run 调用模型的次数
    pub steps: usize,
    /// 基于检索证据作答时的引用校验结果
    pub validation: Option<CitationReport>,
}

enum Dispatch {
    Result(ToolResult),
    End(Option<String>),
    Suspend(PendingApproval),
}

type RunFuture<'s> = Pin<Box<dyn Future<Output = Result<FinalResponse, RunFailure>> + Send + 's>>;

/// 一次循环执行所需的协作者
///
/// 非终止步骤之后与挂起之前调用 checkpoint；终止状态由持有会话的一方保存。
#[derive(Clone)]
pub struct ReactSession<'a> {
    pub planner: &'a Planner,
    pub executor: &'a ToolExecutor,
    pub recovery: &'a RecoveryEngine,
    pub cancel_token: CancellationToken,
    pub max_steps: usize,
    /// 委派嵌套深度上限
    pub max_depth: usize,
    pub streaming: bool,
    pub pipeline: Option<&'a QueryPipeline>,
    pub validator: Option<&'a CitationValidator>,
    pub router: Option<&'a CapabilityRouter>,
    pub approvals: Option<&'a dyn ApprovalChannel>,
    pub checkpoint: Option<&'a dyn Checkpoint>,
    pub event_tx: Option<&'a UnboundedSender<ReactEvent>>,
    depth: usize,
    agent: Option<&'a AgentDescriptor>,
    /// 已获批准、本次可以执行的动作
    approved_action: Option<String>,
}

impl<'a> ReactSession<'a> {
    pub fn new(
        planner: &'a Planner,
        executor: &'a ToolExecutor,
        recovery: &'a RecoveryEngine,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            planner,
            executor,
            recovery,
            cancel_token,
            max_steps: DEFAULT_MAX_STEPS,
            max_depth: DEFAULT_MAX_DEPTH,
            streaming: false,
            pipeline: None,
            validator: None,
            router: None,
            approvals: None,
            checkpoint: None,
            event_tx: None,
            depth: 0,
            agent: None,
            approved_action: None,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_pipeline(mut self, pipeline: &'a QueryPipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_validator(mut self, validator: &'a CitationValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_router(mut self, router: &'a CapabilityRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_approvals(mut self, approvals: &'a dyn ApprovalChannel) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: &'a dyn Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_event_tx(mut self, tx: &'a UnboundedSender<ReactEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 追加用户输入并运行到终止
    pub async fn run(&self, session: &mut Session, input: &str) -> Result<FinalResponse, RunFailure> {
        if session.is_terminated() {
            return Err(fail(session, AgentError::SessionTerminated(session.id.clone())));
        }
        if session.is_awaiting_approval() {
            return Err(fail(session, AgentError::AwaitingApproval(session.id.clone())));
        }
        tracing::info!(session_id = %session.id, depth = self.depth, "run started");
        session.push(Turn::user(input));
        self.drive(session).await
    }

    /// 用外部决定恢复挂起的会话：批准则执行原调用，拒绝则写入拒绝标记，然后继续循环
    pub async fn resume(
        &self,
        session: &mut Session,
        decision: ApprovalDecision,
    ) -> Result<FinalResponse, RunFailure> {
        let pending = match (&session.status, &session.pending_approval) {
            (SessionStatus::AwaitingApproval, Some(p))
                if p.request.correlation_id == decision.correlation_id =>
            {
                p.clone()
            }
            _ => {
                return Err(fail(
                    session,
                    AgentError::NoPendingApproval(decision.correlation_id.clone()),
                ))
            }
        };
        session.pending_approval = None;
        session.status = SessionStatus::Active;
        let action = pending.request.action.clone();
        tracing::info!(
            session_id = %session.id,
            correlation_id = %decision.correlation_id,
            approved = decision.approved,
            %action,
            "resuming after approval decision"
        );

        let result = if decision.approved {
            let mut approved = self.clone();
            approved.approved_action = Some(action.clone());
            match approved.dispatch(session, &pending.call).await {
                Ok(Dispatch::Result(r)) => r,
                Ok(_) => ToolResult::failure(
                    &pending.call,
                    ToolErrorKind::Execution,
                    format!("approved action `{action}` could not be resumed"),
                ),
                Err(AgentError::Cancelled(_)) => {
                    session.push(Turn::tool_result(cancelled_result(&pending.call)));
                    return Ok(self.cancelled(session, 0));
                }
                Err(e) => return Err(fail(session, e)),
            }
        } else {
            let err = AgentError::ApprovalDenied {
                action: action.clone(),
                rationale: decision.rationale.clone(),
            };
            let message = match self.recovery.handle(&err) {
                RecoveryAction::ResumeWithDenial(m) => m,
                _ => err.to_string(),
            };
            send_event(&self.event_tx, ReactEvent::Recovery {
                action: "ResumeWithDenial".to_string(),
                detail: message.clone(),
            });
            ToolResult::failure(&pending.call, ToolErrorKind::ApprovalDenied, message)
        };
        self.observe(&result);
        session.push(Turn::tool_result(result));
        self.save_step(session).await?;
        self.drive(session).await
    }

    async fn drive(&self, session: &mut Session) -> Result<FinalResponse, RunFailure> {
        let mut steps = 0;
        while steps < self.max_steps {
            if self.cancel_token.is_cancelled() {
                return Ok(self.cancelled(session, steps));
            }
            steps += 1;
            session.step_count += 1;
            send_event(&self.event_tx, ReactEvent::StepUpdate {
                session_id: session.id.clone(),
                step: steps,
                max_steps: self.max_steps,
            });

            let request = self.planner.build_request(
                session,
                self.tool_specs(),
                &self.system_prompt(),
                self.streaming,
            );
            send_event(&self.event_tx, ReactEvent::Thinking);
            let event_tx = self.event_tx;
            let planned = self
                .planner
                .plan(&request, &self.cancel_token, |delta| {
                    send_event(&event_tx, ReactEvent::ModelDelta { text: delta.to_string() })
                })
                .await;
            let response = match planned {
                Ok(r) => r,
                Err(ModelError::Cancelled) => return Ok(self.cancelled(session, steps)),
                Err(e) => {
                    let err = model_failure(e);
                    let action = self.recovery.handle(&err);
                    tracing::error!(session_id = %session.id, step = steps, error = %err, "model call failed");
                    send_event(&self.event_tx, ReactEvent::Recovery {
                        action: format!("{action:?}"),
                        detail: err.to_string(),
                    });
                    send_event(&self.event_tx, ReactEvent::Error { text: err.to_string() });
                    return Err(fail(session, err));
                }
            };

            if response.has_tool_calls() {
                if response.text.is_some() {
                    tracing::debug!(session_id = %session.id, "text alongside tool call withheld until calls resolve");
                }
                for (index, mut call) in response.tool_calls.clone().into_iter().enumerate() {
                    if session
                        .turns()
                        .iter()
                        .any(|t| t.as_tool_call().is_some_and(|c| c.id == call.id))
                    {
                        call.id = new_correlation_id();
                    }
                    send_event(&self.event_tx, ReactEvent::ToolCall {
                        tool: call.tool.clone(),
                        correlation_id: call.id.clone(),
                        args: call.args.clone(),
                    });
                    session.push(Turn::tool_call(call.clone()));

                    match self.dispatch(session, &call).await {
                        Ok(Dispatch::Result(result)) => {
                            self.observe(&result);
                            session.push(Turn::tool_result(result));
                        }
                        Ok(Dispatch::End(message)) => {
                            warn_dropped(&session.id, &response.tool_calls[index + 1..], "session ended");
                            session.push(Turn::tool_result(ToolResult::success(
                                &call,
                                json!("session ended"),
                            )));
                            let text = message
                                .or_else(|| response.text.clone())
                                .unwrap_or_else(|| "Goodbye.".to_string());
                            session.push(Turn::assistant(text.clone()));
                            session.terminate(TerminationReason::EndSignal);
                            self.stream_text(&text);
                            return Ok(self.finish(session, text, Termination::EndSignal, steps, None));
                        }
                        Ok(Dispatch::Suspend(pending)) => {
                            warn_dropped(&session.id, &response.tool_calls[index + 1..], "run suspended");
                            return self.suspend(session, pending, steps).await;
                        }
                        Err(AgentError::Cancelled(_)) => {
                            session.push(Turn::tool_result(cancelled_result(&call)));
                            return Ok(self.cancelled(session, steps));
                        }
                        Err(e) => return Err(fail(session, e)),
                    }
                }
                self.save_step(session).await?;
                continue;
            }

            let draft = response.text.unwrap_or(response.raw);
            let (text, validation) = self.validate(session, draft).await;
            session.push(Turn::assistant(text.clone()));
            self.stream_text(&text);
            return Ok(self.finish(session, text, Termination::Completed, steps, validation));
        }

        let marker = AgentError::StepBudgetExceeded(self.max_steps);
        tracing::warn!(session_id = %session.id, steps, "step budget exhausted");
        send_event(&self.event_tx, ReactEvent::Recovery {
            action: "StepBudgetExceeded".to_string(),
            detail: marker.to_string(),
        });
        let text = format!("{}\n\n[{marker}]", partial_answer(session));
        session.push(Turn::assistant(text.clone()));
        session.terminate(TerminationReason::StepBudgetExceeded);
        self.stream_text(&text);
        Ok(self.finish(session, text, Termination::StepBudgetExceeded, steps, None))
    }

    async fn dispatch(&self, session: &Session, call: &ToolCallRequest) -> Result<Dispatch, AgentError> {
        match call.tool.as_str() {
            END_SESSION_TOOL if self.depth == 0 => {
                let message = call
                    .args
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(Dispatch::End(message))
            }
            RETRIEVE_TOOL => self.retrieve(call).await.map(Dispatch::Result),
            DELEGATE_TOOL => self.delegate(session, call).await,
            _ => self.invoke_tool(session, call).await,
        }
    }

    async fn invoke_tool(&self, session: &Session, call: &ToolCallRequest) -> Result<Dispatch, AgentError> {
        let tool = self
            .executor
            .registry()
            .get(&call.tool)
            .filter(|_| self.agent.map_or(true, |a| a.can_use(&call.tool)));
        let Some(tool) = tool else {
            let err = AgentError::UnknownTool(call.tool.clone());
            return Ok(Dispatch::Result(self.feed_back(call, ToolErrorKind::UnknownTool, &err)));
        };
        if let Some(rejected) = self.check_args(tool.spec(), call) {
            return Ok(Dispatch::Result(rejected));
        }

        if self.requires_approval(&call.tool) && self.approved_action.as_deref() != Some(call.tool.as_str()) {
            if self.depth == 0 {
                let description = format!("{} {}", call.tool, call.args);
                return Ok(Dispatch::Suspend(self.pending(session, call, &call.tool, None, description)));
            }
            return Ok(Dispatch::Result(ToolResult::failure(
                call,
                ToolErrorKind::ApprovalRequired,
                format!(
                    "`{0}` requires human approval and was not performed; delegate the task with \"action\": \"{0}\" to request approval",
                    call.tool
                ),
            )));
        }

        let result = self.executor.execute(call, &self.cancel_token).await?;
        Ok(Dispatch::Result(result))
    }

    async fn retrieve(&self, call: &ToolCallRequest) -> Result<ToolResult, AgentError> {
        if let Some(rejected) = self.check_args(&retrieve_spec(), call) {
            return Ok(rejected);
        }
        let Some(pipeline) = self.pipeline else {
            return Ok(ToolResult::failure(call, ToolErrorKind::Retrieval, "retrieval is not configured"));
        };
        let query = call.args.get("query").and_then(Value::as_str).unwrap_or_default();
        let k = call.args.get("k").and_then(Value::as_u64).map(|k| k as usize);
        let filters: BTreeMap<String, String> = call
            .args
            .get("filters")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        match pipeline.run(query, k, filters, &self.cancel_token).await {
            Ok(PipelineOutcome::Rejected { reason }) => Ok(ToolResult::success(
                call,
                json!({
                    "rejected": true,
                    "reason": reason,
                    "message": "This question is outside the supported domain. Tell the user it cannot be answered here.",
                }),
            )),
            Ok(PipelineOutcome::Evidence(result)) => {
                send_event(&self.event_tx, ReactEvent::Retrieval {
                    query: result.normalized.clone(),
                    sub_queries: result.sub_queries.clone(),
                    hits: result.hits.len(),
                });
                Ok(ToolResult::success(
                    call,
                    json!({
                        "query": result.normalized,
                        "sub_queries": result.sub_queries,
                        "hits": result.hits,
                    }),
                ))
            }
            Err(RetrievalError::Cancelled) => Err(AgentError::Cancelled(format!("retrieval {}", call.id))),
            Err(e) => Ok(ToolResult::failure(call, ToolErrorKind::Retrieval, e.to_string())),
        }
    }

    async fn delegate(&self, session: &Session, call: &ToolCallRequest) -> Result<Dispatch, AgentError> {
        if let Some(rejected) = self.check_args(&delegate_spec(), call) {
            return Ok(Dispatch::Result(rejected));
        }
        let request = match DelegationRequest::from_args(&call.args) {
            Ok(r) => r,
            Err(e) => return Ok(Dispatch::Result(ToolResult::failure(call, ToolErrorKind::Delegation, e))),
        };
        let Some(router) = self.router.filter(|r| !r.is_empty()) else {
            return Ok(Dispatch::Result(ToolResult::failure(
                call,
                ToolErrorKind::Delegation,
                "no agents are registered",
            )));
        };
        if self.depth >= self.max_depth {
            return Ok(Dispatch::Result(ToolResult::failure(
                call,
                ToolErrorKind::Delegation,
                format!("delegation depth limit ({}) reached", self.max_depth),
            )));
        }
        let Some(agent) = router.route(&request) else {
            return Ok(Dispatch::Result(ToolResult::failure(
                call,
                ToolErrorKind::Delegation,
                format!("no agent matches capabilities {:?}", request.capabilities),
            )));
        };

        let approved = match &request.action {
            Some(action) if agent.requires_approval(action) || self.requires_approval(action) => {
                if self.approved_action.as_deref() != Some(action.as_str()) {
                    if self.depth == 0 {
                        return Ok(Dispatch::Suspend(self.pending(
                            session,
                            call,
                            action,
                            Some(&agent.id),
                            request.task.clone(),
                        )));
                    }
                    return Ok(Dispatch::Result(ToolResult::failure(
                        call,
                        ToolErrorKind::ApprovalRequired,
                        format!("`{action}` requires human approval and was not performed"),
                    )));
                }
                Some(action.clone())
            }
            _ => None,
        };

        send_event(&self.event_tx, ReactEvent::Delegation {
            agent_id: agent.id.clone(),
            task: request.task.clone(),
            depth: self.depth + 1,
        });
        tracing::info!(session_id = %session.id, agent_id = %agent.id, depth = self.depth + 1, "delegating");

        let mut nested = self.clone();
        nested.depth += 1;
        nested.agent = Some(agent);
        nested.approved_action = approved;
        nested.checkpoint = None;

        let mut child = Session::scoped(session, &agent.id);
        let input = match &request.action {
            Some(action) => format!("{}\n\nAction to perform: {action}", request.task),
            None => request.task.clone(),
        };
        match nested.run_boxed(&mut child, &input).await {
            Ok(resp) => {
                if resp.termination == Termination::Cancelled {
                    return Err(AgentError::Cancelled(format!("delegation to {}", agent.id)));
                }
                let payload = json!({
                    "agent_id": agent.id,
                    "answer": resp.text,
                    "steps": resp.steps,
                    "termination": resp.termination.as_str(),
                });
                if matches!(resp.termination, Termination::Completed | Termination::EndSignal) {
                    Ok(Dispatch::Result(ToolResult::success(call, payload)))
                } else {
                    let mut failed = ToolResult::failure(call, ToolErrorKind::Delegation, resp.text);
                    failed.payload = payload;
                    Ok(Dispatch::Result(failed))
                }
            }
            Err(failure) => match failure.error {
                e @ (AgentError::Cancelled(_) | AgentError::ModelUnavailable { .. }) => Err(e),
                e => Ok(Dispatch::Result(ToolResult::failure(
                    call,
                    ToolErrorKind::Delegation,
                    format!("agent `{}` failed: {e}", agent.id),
                ))),
            },
        }
    }

    /// 嵌套循环的 future 装箱后返回
    fn run_boxed<'s>(&'s self, session: &'s mut Session, input: &'s str) -> RunFuture<'s> {
        Box::pin(self.run(session, input))
    }

    async fn suspend(
        &self,
        session: &mut Session,
        pending: PendingApproval,
        steps: usize,
    ) -> Result<FinalResponse, RunFailure> {
        let request = pending.request.clone();
        session.pending_approval = Some(pending);
        session.status = SessionStatus::AwaitingApproval;
        // 先落盘再对外发出请求
        self.save_step(session).await?;
        if let Some(channel) = self.approvals {
            channel
                .emit(request.clone())
                .await
                .map_err(|e| fail(session, e))?;
        }
        tracing::info!(
            session_id = %session.id,
            correlation_id = %request.correlation_id,
            action = %request.action,
            "suspended awaiting approval"
        );
        send_event(&self.event_tx, ReactEvent::ApprovalRequested {
            correlation_id: request.correlation_id.clone(),
            action: request.action.clone(),
            description: request.description.clone(),
        });
        let text = format!(
            "Approval required before `{}`: {}",
            request.action, request.description
        );
        Ok(self.finish(session, text, Termination::AwaitingApproval(request), steps, None))
    }

    fn pending(
        &self,
        session: &Session,
        call: &ToolCallRequest,
        action: &str,
        agent_id: Option<&str>,
        description: String,
    ) -> PendingApproval {
        PendingApproval {
            request: ApprovalRequest {
                correlation_id: call.id.clone(),
                session_id: session.id.clone(),
                agent_id: agent_id.map(str::to_string),
                action: action.to_string(),
                description,
                requested_at: Utc::now(),
            },
            call: call.clone(),
        }
    }

    /// 任一已注册智能体把该动作列为需审批，就在所有层级都受审批约束；
    /// 委派时声明了这类动作，顶层即挂起等待审批，与路由到哪个智能体无关
    fn requires_approval(&self, action: &str) -> bool {
        self.agent.is_some_and(|a| a.requires_approval(action))
            || self.router.is_some_and(|r| r.any_requires_approval(action))
    }

    fn can_delegate(&self) -> bool {
        self.router.is_some_and(|r| !r.is_empty()) && self.depth < self.max_depth
    }

    /// 本层可见的工具：注册表（按智能体范围过滤）+ 保留工具
    fn tool_specs(&self) -> Vec<ToolSpec> {
        let registry = self.executor.registry();
        let mut specs = match self.agent {
            Some(agent) if !agent.tools.is_empty() => registry.specs_for(&agent.tools),
            _ => registry.specs(),
        };
        if self.pipeline.is_some() {
            specs.push(retrieve_spec());
        }
        if self.can_delegate() {
            specs.push(delegate_spec());
        }
        if self.depth == 0 {
            specs.push(end_session_spec());
        }
        specs
    }

    fn system_prompt(&self) -> String {
        let mut prompt = match self.agent {
            Some(agent) => match &agent.system_prompt {
                Some(p) => p.clone(),
                None => format!(
                    "{}\n\nYou are the `{}` agent: {}",
                    self.planner.base_system_prompt(),
                    agent.id,
                    agent.description
                ),
            },
            None => self.planner.base_system_prompt().to_string(),
        };
        if let Some(router) = self.router.filter(|_| self.can_delegate()) {
            prompt.push_str("\n\n## Agents\n");
            prompt.push_str(&router.describe());
        }
        prompt
    }

    /// 参数不合法：不执行，转为模型可见的结构化错误
    fn check_args(&self, spec: &ToolSpec, call: &ToolCallRequest) -> Option<ToolResult> {
        let violation = spec.validate_args(&call.args).err()?;
        let err = AgentError::SchemaValidation {
            tool: call.tool.clone(),
            violation,
        };
        Some(self.feed_back(call, ToolErrorKind::SchemaValidation, &err))
    }

    fn feed_back(&self, call: &ToolCallRequest, kind: ToolErrorKind, err: &AgentError) -> ToolResult {
        let message = match self.recovery.handle(err) {
            RecoveryAction::FeedBackToModel(m) => m,
            _ => err.to_string(),
        };
        send_event(&self.event_tx, ReactEvent::Recovery {
            action: "FeedBackToModel".to_string(),
            detail: message.clone(),
        });
        ToolResult::failure(call, kind, message)
    }

    /// 有检索证据时做引用校验；不被支持的句子已在 report 中标记
    async fn validate(&self, session: &Session, draft: String) -> (String, Option<CitationReport>) {
        let Some(validator) = self.validator else {
            return (draft, None);
        };
        let evidence = run_evidence(session);
        if evidence.is_empty() {
            return (draft, None);
        }
        let question = last_user_text(session).unwrap_or_default();
        let report = validator
            .validate(question, &draft, &evidence, &self.cancel_token)
            .await;
        if !report.all_supported() {
            send_event(&self.event_tx, ReactEvent::Recovery {
                action: "CitationCheck".to_string(),
                detail: format!("{} unsupported sentence(s) flagged", report.unsupported().count()),
            });
        }
        let text = if report.all_supported() && !report.regenerated {
            draft
        } else {
            report.render()
        };
        (text, Some(report))
    }

    async fn save_step(&self, session: &Session) -> Result<(), RunFailure> {
        if let Some(cp) = self.checkpoint {
            cp.checkpoint(session).await.map_err(|e| fail(session, e))?;
        }
        Ok(())
    }

    fn observe(&self, result: &ToolResult) {
        let rendered = result.render();
        let mut preview: String = rendered.chars().take(OBSERVATION_PREVIEW_CHARS).collect();
        if rendered.chars().count() > OBSERVATION_PREVIEW_CHARS {
            preview.push_str("...");
        }
        if !result.success {
            tracing::debug!(tool = %result.tool, correlation_id = %result.correlation_id, "tool result is a failure");
        }
        send_event(&self.event_tx, ReactEvent::Observation {
            tool: result.tool.clone(),
            correlation_id: result.correlation_id.clone(),
            ok: result.success,
            preview,
        });
    }

    fn cancelled(&self, session: &mut Session, steps: usize) -> FinalResponse {
        tracing::info!(session_id = %session.id, "run cancelled");
        session.terminate(TerminationReason::Cancelled);
        send_event(&self.event_tx, ReactEvent::Error {
            text: "Cancelled by user".to_string(),
        });
        self.finish(session, "Cancelled.".to_string(), Termination::Cancelled, steps, None)
    }

    /// 只有顶层向前端推送最终回复
    fn stream_text(&self, text: &str) {
        if self.depth > 0 {
            return;
        }
        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(CHUNK_CHARS) {
            send_event(&self.event_tx, ReactEvent::MessageChunk {
                text: chunk.iter().collect(),
            });
        }
        send_event(&self.event_tx, ReactEvent::MessageDone);
    }

    fn finish(
        &self,
        session: &Session,
        text: String,
        termination: Termination,
        steps: usize,
        validation: Option<CitationReport>,
    ) -> FinalResponse {
        tracing::info!(
            session_id = %session.id,
            depth = self.depth,
            steps,
            termination = termination.as_str(),
            "run finished"
        );
        if self.depth == 0 {
            let (prompt_tokens, completion_tokens, total_tokens) = self.planner.token_usage();
            send_event(&self.event_tx, ReactEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens,
            });
        }
        FinalResponse {
            session_id: session.id.clone(),
            text,
            termination,
            steps,
            validation,
        }
    }
}

fn send_event(tx: &Option<&UnboundedSender<ReactEvent>>, ev: ReactEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

fn fail(session: &Session, error: AgentError) -> RunFailure {
    RunFailure::new(error, session.turns().to_vec())
}

fn model_failure(e: ModelError) -> AgentError {
    match e {
        ModelError::Exhausted { attempts, message } => AgentError::ModelUnavailable { attempts, message },
        other => AgentError::ModelUnavailable {
            attempts: 1,
            message: other.to_string(),
        },
    }
}

/// 挂起或结束后，同一回复里其余的调用不再执行，也不写入历史
fn warn_dropped(session_id: &str, rest: &[ToolCallRequest], why: &str) {
    if rest.is_empty() {
        return;
    }
    let tools: Vec<&str> = rest.iter().map(|c| c.tool.as_str()).collect();
    tracing::warn!(session_id, ?tools, reason = why, "remaining tool calls in the response were dropped");
}

fn cancelled_result(call: &ToolCallRequest) -> ToolResult {
    ToolResult::failure(call, ToolErrorKind::Execution, "cancelled before completion")
}

/// 当前轮（最后一条用户输入之后）的 turn
fn current_round(session: &Session) -> &[Turn] {
    let turns = session.turns();
    let start = turns
        .iter()
        .rposition(|t| t.role == Role::User)
        .map(|i| i + 1)
        .unwrap_or(0);
    &turns[start..]
}

fn last_user_text(session: &Session) -> Option<&str> {
    session
        .turns()
        .iter()
        .rev()
        .filter(|t| t.role == Role::User)
        .find_map(|t| t.text())
}

/// 当前轮检索到的证据（合并去重）
fn run_evidence(session: &Session) -> Vec<RetrievalHit> {
    let lists: Vec<Vec<RetrievalHit>> = current_round(session)
        .iter()
        .filter_map(|t| t.as_tool_result())
        .filter(|r| r.success && r.tool == RETRIEVE_TOOL)
        .filter_map(|r| r.payload.get("hits").cloned())
        .filter_map(|hits| serde_json::from_value(hits).ok())
        .collect();
    merge_results(lists)
}

/// 步数耗尽时的降级答复：最近一次工具结果
fn partial_answer(session: &Session) -> String {
    current_round(session)
        .iter()
        .rev()
        .find_map(|t| t.as_tool_result())
        .map(|r| format!("Best effort so far (last result from `{}`): {}", r.tool, r.render()))
        .unwrap_or_else(|| "No final answer could be produced.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::TaskScheduler;
    use crate::llm::{Scripted, ScriptedModelClient};
    use crate::retrieval::{Document, InMemoryRetrievalGateway, PipelineConfig};
    use crate::tools::{EchoTool, ToolRegistry};

    struct Fixture {
        model: Arc<ScriptedModelClient>,
        planner: Planner,
        executor: ToolExecutor,
        recovery: RecoveryEngine,
    }

    fn fixture(script: Vec<Scripted>) -> Fixture {
        let model = Arc::new(ScriptedModelClient::new(script));
        let mut registry = ToolRegistry::default();
        registry.register(EchoTool::new()).unwrap();
        Fixture {
            planner: Planner::new(model.clone(), "You are a test agent."),
            executor: ToolExecutor::new(Arc::new(registry), Arc::new(TaskScheduler::default())),
            recovery: RecoveryEngine::new(),
            model,
        }
    }

    impl Fixture {
        fn react(&self) -> ReactSession<'_> {
            ReactSession::new(&self.planner, &self.executor, &self.recovery, CancellationToken::new())
        }
    }

    #[tokio::test]
    async fn test_plain_text_is_terminal() {
        let f = fixture(vec![Scripted::output("Hello there.")]);
        let mut session = Session::new("s");
        let resp = f.react().run(&mut session, "hi").await.unwrap();
        assert_eq!(resp.termination, Termination::Completed);
        assert_eq!(resp.text, "Hello there.");
        assert_eq!(resp.steps, 1);
        assert_eq!(session.turns().len(), 2);
    }

    #[tokio::test]
    async fn test_tool_call_takes_precedence_over_text() {
        let f = fixture(vec![
            Scripted::output("Sure, echoing now. {\"tool\": \"echo\", \"args\": {\"text\": \"x\"}}"),
            Scripted::output("Echoed x."),
        ]);
        let mut session = Session::new("s");
        let resp = f.react().run(&mut session, "echo x").await.unwrap();
        assert_eq!(resp.text, "Echoed x.");
        let second = &f.model.requests()[1];
        let result = second.history.last().and_then(|t| t.as_tool_result()).unwrap();
        assert!(result.success);
        assert_eq!(result.payload, json!("x"));
        assert!(session.turns().iter().all(|t| t.text() != Some("Sure, echoing now.")));
    }

    #[tokio::test]
    async fn test_schema_violation_fed_back_not_executed() {
        let f = fixture(vec![
            Scripted::tool_call("echo", json!({})),
            Scripted::output("Sorry."),
        ]);
        let mut session = Session::new("s");
        f.react().run(&mut session, "echo").await.unwrap();
        let fed = f.model.requests()[1].history.last().and_then(|t| t.as_tool_result()).cloned().unwrap();
        assert_eq!(fed.error_kind(), Some(ToolErrorKind::SchemaValidation));
        assert!(fed.render().contains("text"));
    }

    #[tokio::test]
    async fn test_end_session_from_model() {
        let f = fixture(vec![Scripted::tool_call("end_session", json!({"message": "Bye!"}))]);
        let mut session = Session::new("s");
        let resp = f.react().run(&mut session, "that's all").await.unwrap();
        assert_eq!(resp.termination, Termination::EndSignal);
        assert_eq!(resp.text, "Bye!");
        assert!(session.is_terminated());
        let err = f.react().run(&mut session, "again").await.unwrap_err();
        assert!(matches!(err.error, AgentError::SessionTerminated(_)));
    }

    #[tokio::test]
    async fn test_step_budget_gives_degraded_answer() {
        let f = fixture(
            (0..5)
                .map(|i| Scripted::tool_call("echo", json!({"text": format!("loop {i}")})))
                .collect(),
        );
        let mut session = Session::new("s");
        let resp = f.react().with_max_steps(3).run(&mut session, "go").await.unwrap();
        assert_eq!(resp.termination, Termination::StepBudgetExceeded);
        assert_eq!(resp.steps, 3);
        assert_eq!(f.model.requests().len(), 3);
        assert!(resp.text.contains("loop 2"));
        assert!(resp.text.contains("StepBudgetExceeded"));
        assert_eq!(
            session.status,
            SessionStatus::Terminated { reason: TerminationReason::StepBudgetExceeded }
        );
    }

    #[tokio::test]
    async fn test_retrieve_injects_evidence_and_validates() {
        let f = fixture(vec![
            Scripted::tool_call("retrieve", json!({"query": "best hotel in Paris"})),
            Scripted::output("Le Meurice is the best hotel in Paris. It has a rooftop zoo."),
        ]);
        let gateway = Arc::new(InMemoryRetrievalGateway::with_documents(vec![Document::new(
            "h1",
            "Le Meurice is the best hotel in Paris.",
        )]));
        let pipeline = QueryPipeline::new(gateway, PipelineConfig::default(), Arc::new(TaskScheduler::default()));
        let validator = CitationValidator::new(0.5);
        let mut session = Session::new("s");
        let resp = f
            .react()
            .with_pipeline(&pipeline)
            .with_validator(&validator)
            .run(&mut session, "best hotel?")
            .await
            .unwrap();
        let report = resp.validation.unwrap();
        assert!(report.sentences[0].supported);
        assert!(!report.sentences[1].supported);
        assert!(resp.text.contains("[unverified] It has a rooftop zoo."));
    }

    #[tokio::test]
    async fn test_cancelled_token_terminates_session() {
        let f = fixture(vec![Scripted::output("never")]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let react = ReactSession::new(&f.planner, &f.executor, &f.recovery, cancel);
        let mut session = Session::new("s");
        let resp = react.run(&mut session, "hi").await.unwrap();
        assert_eq!(resp.termination, Termination::Cancelled);
        assert!(f.model.requests().is_empty());
        assert_eq!(
            session.status,
            SessionStatus::Terminated { reason: TerminationReason::Cancelled }
        );
    }

    #[tokio::test]
    async fn test_delegation_runs_nested_loop_on_scoped_session() {
        let f = fixture(vec![
            Scripted::tool_call("delegate", json!({"task": "say hi", "capabilities": ["greeting"]})),
            // 子智能体的回复
            Scripted::output("hi from greeter"),
            Scripted::with(|req| {
                let r = req.history.last().and_then(|t| t.as_tool_result()).unwrap();
                format!("Greeter said: {}", r.payload["answer"].as_str().unwrap_or_default())
            }),
        ]);
        let router = CapabilityRouter::from_agents(vec![
            AgentDescriptor::new("greeter", "says hello").with_capabilities(["greeting"]),
        ])
        .unwrap();
        let mut session = Session::new("p");
        let resp = f.react().with_router(&router).run(&mut session, "greet me").await.unwrap();
        assert_eq!(resp.text, "Greeter said: hi from greeter");
        let nested_request = &f.model.requests()[1];
        assert!(nested_request.system_prompt.contains("`greeter` agent"));
        assert_eq!(nested_request.history.len(), 1);
        // 父会话只多了一对 调用/结果
        assert_eq!(session.turns().len(), 4);
    }

    #[tokio::test]
    async fn test_gated_call_inside_nested_loop_is_not_executed() {
        let f = fixture(vec![
            Scripted::tool_call("delegate", json!({"task": "echo secret", "agent_id": "guarded"})),
            Scripted::tool_call("echo", json!({"text": "secret"})),
            Scripted::output("could not echo"),
            Scripted::output("The guarded agent could not do it."),
        ]);
        let router = CapabilityRouter::from_agents(vec![AgentDescriptor::new("guarded", "echo needs approval")
            .with_tools(["echo"])
            .with_approval(["echo"])])
        .unwrap();
        let mut session = Session::new("p");
        let resp = f.react().with_router(&router).run(&mut session, "go").await.unwrap();
        assert_eq!(resp.termination, Termination::Completed);
        let nested = &f.model.requests()[2];
        let denied = nested.history.last().and_then(|t| t.as_tool_result()).unwrap();
        assert_eq!(denied.error_kind(), Some(ToolErrorKind::ApprovalRequired));
    }

    fn guarded_and_open() -> CapabilityRouter {
        CapabilityRouter::from_agents(vec![
            AgentDescriptor::new("guarded", "echo needs approval")
                .with_tools(["echo"])
                .with_approval(["echo"]),
            AgentDescriptor::new("open", "echoes freely").with_tools(["echo"]),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_declared_action_gated_by_other_agent_suspends_parent() {
        let f = fixture(vec![
            Scripted::tool_call("delegate", json!({"task": "echo secret", "agent_id": "open", "action": "echo"})),
            // 批准后子智能体执行
            Scripted::tool_call("echo", json!({"text": "secret"})),
            Scripted::output("echoed secret"),
            Scripted::output("Done."),
        ]);
        let router = guarded_and_open();
        let mut session = Session::new("p");
        let resp = f.react().with_router(&router).run(&mut session, "go").await.unwrap();
        let Termination::AwaitingApproval(request) = resp.termination else {
            panic!("expected suspension, got {:?}", resp.termination);
        };
        assert_eq!(request.agent_id.as_deref(), Some("open"));
        assert_eq!(f.model.requests().len(), 1);

        let resp = f
            .react()
            .with_router(&router)
            .resume(&mut session, ApprovalDecision::approve(&request.correlation_id))
            .await
            .unwrap();
        assert_eq!(resp.text, "Done.");
        let nested = &f.model.requests()[2];
        let echoed = nested.history.last().and_then(|t| t.as_tool_result()).unwrap();
        assert!(echoed.success);
        assert_eq!(echoed.payload, json!("secret"));
    }

    #[tokio::test]
    async fn test_calls_after_suspension_are_not_recorded() {
        let f = fixture(vec![
            Scripted::output(
                json!([
                    {"id": "c-1", "tool": "echo", "args": {"text": "first"}},
                    {"id": "c-2", "tool": "echo", "args": {"text": "second"}},
                ])
                .to_string(),
            ),
            Scripted::output("Only the first ran."),
        ]);
        let router = guarded_and_open();
        let mut session = Session::new("p");
        let resp = f.react().with_router(&router).run(&mut session, "echo twice").await.unwrap();
        let Termination::AwaitingApproval(request) = resp.termination else {
            panic!("expected suspension, got {:?}", resp.termination);
        };
        assert_eq!(request.correlation_id, "c-1");
        let calls: Vec<&str> = session
            .turns()
            .iter()
            .filter_map(|t| t.as_tool_call())
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(calls, vec!["c-1"]);

        let resp = f
            .react()
            .with_router(&router)
            .resume(&mut session, ApprovalDecision::approve("c-1"))
            .await
            .unwrap();
        assert_eq!(resp.text, "Only the first ran.");
        let results: Vec<&ToolResult> = session.turns().iter().filter_map(|t| t.as_tool_result()).collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].correlation_id, "c-1");
        assert_eq!(results[0].payload, json!("first"));
    }
}
