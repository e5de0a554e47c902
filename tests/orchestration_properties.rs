//! 编排不变量：历史单调、调用/结果配对、步数预算、取消、模型耗尽、版本冲突、持久化

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive::core::OrchestratorBuilder;
use futures_util::stream;
use hive::llm::{
    MockModelClient, ModelClient, ModelError, ModelEvent, ModelEventStream, ModelRequest,
    ModelResponse, RetryConfig, RetryingModelClient, Scripted, ScriptedModelClient,
};
use hive::react::Termination;
use hive::session::{
    MemorySessionStore, Session, SessionStatus, SessionStore, SqliteSessionStore, StoreError,
    TerminationReason, Turn,
};
use hive::tools::{BookingBook, EchoTool, FieldSpec, FieldType, Tool, ToolSpec};
use hive::AgentError;
use serde_json::{json, Value};
use tokio::sync::Notify;

/// 每个工具调用在历史中恰有一个结果，且 id 唯一
fn assert_paired(history: &[Turn]) {
    let calls: Vec<&str> = history
        .iter()
        .filter_map(|t| t.as_tool_call())
        .map(|c| c.id.as_str())
        .collect();
    let mut unique = calls.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), calls.len(), "duplicate correlation ids: {calls:?}");
    for id in calls {
        let results = history
            .iter()
            .filter_map(|t| t.as_tool_result())
            .filter(|r| r.correlation_id == id)
            .count();
        assert_eq!(results, 1, "call {id} has {results} results");
    }
}

#[tokio::test]
async fn test_history_only_grows() {
    let orchestrator = OrchestratorBuilder::new(Arc::new(MockModelClient))
        .tool(EchoTool::new())
        .build()
        .unwrap();
    let mut previous: Vec<Turn> = Vec::new();
    for input in ["one", "two", "three"] {
        let resp = orchestrator.submit("s", input).await.unwrap();
        assert!(resp.text.contains(input));
        let session = orchestrator.session("s").await.unwrap().unwrap();
        let turns = session.turns();
        assert!(turns.len() > previous.len());
        for (old, new) in previous.iter().zip(turns) {
            assert_eq!(old.render(), new.render());
            assert_eq!(old.timestamp, new.timestamp);
        }
        assert!(turns.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        previous = turns.to_vec();
    }
}

#[tokio::test]
async fn test_every_call_gets_exactly_one_result_before_next_model_call() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        Scripted::output(
            json!([
                {"id": "c-1", "tool": "echo", "args": {"text": "a"}},
                {"id": "c-1", "tool": "echo", "args": {"text": "b"}},
            ])
            .to_string(),
        ),
        Scripted::output(json!({"id": "c-1", "tool": "missing_tool", "args": {}}).to_string()),
        Scripted::output(json!({"tool": "echo", "args": {"wrong": 1}}).to_string()),
        Scripted::output("done"),
    ]));
    let orchestrator = OrchestratorBuilder::new(model.clone())
        .tool(EchoTool::new())
        .build()
        .unwrap();
    let resp = orchestrator.submit("s", "go").await.unwrap();
    assert_eq!(resp.text, "done");

    let requests = model.requests();
    assert_eq!(requests.len(), 4);
    for request in &requests {
        assert_paired(&request.history);
    }
    let session = orchestrator.session("s").await.unwrap().unwrap();
    assert_paired(session.turns());
    assert_eq!(session.turns().iter().filter(|t| t.as_tool_call().is_some()).count(), 4);
}

#[tokio::test]
async fn test_step_budget_terminates_session() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        Scripted::tool_call("echo", json!({"text": "first"})),
        Scripted::tool_call("echo", json!({"text": "second"})),
        Scripted::output("never reached"),
    ]));
    let orchestrator = OrchestratorBuilder::new(model.clone())
        .tool(EchoTool::new())
        .max_steps(2)
        .build()
        .unwrap();
    let resp = orchestrator.submit("s", "loop").await.unwrap();
    assert_eq!(resp.termination, Termination::StepBudgetExceeded);
    assert!(resp.text.contains("second"));
    assert_eq!(model.remaining(), 1);

    let session = orchestrator.session("s").await.unwrap().unwrap();
    assert_eq!(
        session.status,
        SessionStatus::Terminated { reason: TerminationReason::StepBudgetExceeded }
    );
    let err = orchestrator.submit("s", "again").await.unwrap_err();
    assert!(matches!(err.error, AgentError::SessionTerminated(_)));
}

struct SlowTool {
    spec: ToolSpec,
    started: Arc<Notify>,
}

impl SlowTool {
    fn new(started: Arc<Notify>) -> Self {
        Self {
            spec: ToolSpec::new("slow", "Takes a long time.")
                .input(FieldSpec::optional("note", FieldType::String, "ignored")),
            started,
        }
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, _args: Value) -> Result<Value, String> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(json!("finished"))
    }
}

#[tokio::test]
async fn test_cancel_interrupts_in_flight_tool() {
    let started = Arc::new(Notify::new());
    let model = Arc::new(ScriptedModelClient::new(vec![Scripted::tool_call("slow", json!({}))]));
    let orchestrator = Arc::new(
        OrchestratorBuilder::new(model)
            .tool(SlowTool::new(started.clone()))
            .tool_timeout(Duration::from_secs(7200))
            .build()
            .unwrap(),
    );

    let running = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.submit("s", "take your time").await })
    };
    started.notified().await;

    let busy = orchestrator.submit("s", "hurry").await.unwrap_err();
    assert!(matches!(busy.error, AgentError::SessionBusy(_)));
    assert!(!orchestrator.cancel("other"));
    assert!(orchestrator.cancel("s"));

    let resp = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("cancellation is prompt")
        .unwrap()
        .unwrap();
    assert_eq!(resp.termination, Termination::Cancelled);

    let session = orchestrator.session("s").await.unwrap().unwrap();
    assert_eq!(
        session.status,
        SessionStatus::Terminated { reason: TerminationReason::Cancelled }
    );
    let last = session.turns().last().and_then(|t| t.as_tool_result()).unwrap();
    assert!(!last.success);
    assert_paired(session.turns());
}

#[tokio::test]
async fn test_model_exhaustion_returns_failure_with_trace() {
    let scripted = Arc::new(ScriptedModelClient::new(vec![
        Scripted::Error(ModelError::Unavailable("down".to_string())),
        Scripted::Error(ModelError::Unavailable("down".to_string())),
        Scripted::Error(ModelError::Unavailable("still down".to_string())),
    ]));
    let model = Arc::new(RetryingModelClient::new(
        scripted.clone(),
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        },
    ));
    let orchestrator = OrchestratorBuilder::new(model).build().unwrap();
    let failure = orchestrator.submit("s", "hello").await.unwrap_err();
    assert!(matches!(failure.error, AgentError::ModelUnavailable { attempts: 3, .. }));
    assert_eq!(failure.trace.len(), 1);
    assert_eq!(failure.trace[0].text(), Some("hello"));
    assert_eq!(scripted.requests().len(), 3);
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        multiplier: 2.0,
    }
}

/// 前 failures 次流在输出一段增量后断开，之后正常结束
struct FlakyStream {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyStream {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModelClient for FlakyStream {
    fn name(&self) -> &str {
        "flaky-stream"
    }

    async fn invoke(&self, _request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        Err(ModelError::InvalidRequest("streaming only".to_string()))
    }

    async fn invoke_stream(&self, _request: &ModelRequest) -> Result<ModelEventStream, ModelError> {
        let events = if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            vec![
                Ok(ModelEvent::TextDelta("par".to_string())),
                Err(ModelError::Unavailable("connection reset".to_string())),
            ]
        } else {
            vec![
                Ok(ModelEvent::TextDelta("Recovered ".to_string())),
                Ok(ModelEvent::TextDelta("answer.".to_string())),
                Ok(ModelEvent::Completed),
            ]
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

#[tokio::test]
async fn test_stream_broken_mid_way_is_retried_with_backoff() {
    let flaky = Arc::new(FlakyStream::new(1));
    let model = Arc::new(RetryingModelClient::new(flaky.clone(), fast_retry(3)));
    let orchestrator = OrchestratorBuilder::new(model).streaming(true).build().unwrap();
    let resp = orchestrator.submit("s", "hello").await.unwrap();
    assert_eq!(resp.text, "Recovered answer.");
    assert_eq!(resp.termination, Termination::Completed);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stream_that_keeps_breaking_exhausts_retries() {
    let flaky = Arc::new(FlakyStream::new(usize::MAX));
    let model = Arc::new(RetryingModelClient::new(flaky.clone(), fast_retry(3)));
    let orchestrator = OrchestratorBuilder::new(model).streaming(true).build().unwrap();
    let failure = orchestrator.submit("s", "hello").await.unwrap_err();
    assert!(matches!(failure.error, AgentError::ModelUnavailable { attempts: 3, .. }));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
}

/// 第一次保存时注入一次版本冲突
struct ConflictOnce {
    inner: MemorySessionStore,
    tripped: AtomicBool,
}

#[async_trait]
impl SessionStore for ConflictOnce {
    async fn load(&self, session_id: &str) -> Result<Option<(Session, u64)>, StoreError> {
        self.inner.load(session_id).await
    }

    async fn save(&self, session: &Session, expected_version: u64) -> Result<u64, StoreError> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(StoreError::VersionConflict {
                session_id: session.id.clone(),
                expected: expected_version,
                found: expected_version + 1,
            });
        }
        self.inner.save(session, expected_version).await
    }
}

struct AlwaysConflict;

#[async_trait]
impl SessionStore for AlwaysConflict {
    async fn load(&self, _session_id: &str) -> Result<Option<(Session, u64)>, StoreError> {
        Ok(None)
    }

    async fn save(&self, session: &Session, expected_version: u64) -> Result<u64, StoreError> {
        Err(StoreError::VersionConflict {
            session_id: session.id.clone(),
            expected: expected_version,
            found: expected_version + 1,
        })
    }
}

#[tokio::test]
async fn test_version_conflict_retries_whole_run() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        Scripted::output("first attempt"),
        Scripted::output("second attempt"),
    ]));
    let store = Arc::new(ConflictOnce {
        inner: MemorySessionStore::new(),
        tripped: AtomicBool::new(false),
    });
    let orchestrator = OrchestratorBuilder::new(model.clone())
        .store(store)
        .build()
        .unwrap();
    let resp = orchestrator.submit("s", "hi").await.unwrap();
    assert_eq!(resp.text, "second attempt");
    let session = orchestrator.session("s").await.unwrap().unwrap();
    assert_eq!(session.turns().len(), 2);
}

#[tokio::test]
async fn test_version_conflict_after_booking_is_not_replayed() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        Scripted::tool_call("create_booking", json!({"guests": 2, "time": "19:00"})),
        Scripted::tool_call("create_booking", json!({"guests": 2, "time": "19:00"})),
        Scripted::output("Booked."),
    ]));
    let book = BookingBook::with_id_generator(|| "ABC123".to_string());
    let store = Arc::new(ConflictOnce {
        inner: MemorySessionStore::new(),
        tripped: AtomicBool::new(false),
    });
    let orchestrator = book
        .tools()
        .into_iter()
        .fold(OrchestratorBuilder::new(model.clone()), |b, t| b.tool_arc(t))
        .store(store)
        .build()
        .unwrap();

    let failure = orchestrator.submit("s", "book a table for 2 at 7pm").await.unwrap_err();
    assert!(matches!(failure.error, AgentError::VersionConflict { .. }));
    assert_eq!(book.len().await, 1);
    assert_eq!(model.requests().len(), 1);
    let booked = failure
        .trace
        .iter()
        .filter_map(|t| t.as_tool_result())
        .find(|r| r.tool == "create_booking")
        .unwrap();
    assert!(booked.success);
    assert_eq!(booked.payload["booking_id"], json!("ABC123"));
}

#[tokio::test]
async fn test_version_conflict_gives_up_after_limit() {
    let model = Arc::new(ScriptedModelClient::new(
        (0..3).map(|i| Scripted::output(format!("attempt {i}"))).collect(),
    ));
    let orchestrator = OrchestratorBuilder::new(model.clone())
        .store(Arc::new(AlwaysConflict))
        .max_conflict_retries(2)
        .build()
        .unwrap();
    let failure = orchestrator.submit("s", "hi").await.unwrap_err();
    assert!(matches!(failure.error, AgentError::VersionConflict { .. }));
    assert_eq!(model.requests().len(), 3);
}

#[tokio::test]
async fn test_sqlite_sessions_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.db");

    let first = OrchestratorBuilder::new(Arc::new(MockModelClient))
        .tool(EchoTool::new())
        .store(Arc::new(SqliteSessionStore::open(&path).unwrap()))
        .build()
        .unwrap();
    first.submit("s", "remember me").await.unwrap();
    drop(first);

    let second = OrchestratorBuilder::new(Arc::new(MockModelClient))
        .tool(EchoTool::new())
        .store(Arc::new(SqliteSessionStore::open(&path).unwrap()))
        .build()
        .unwrap();
    let restored = second.session("s").await.unwrap().unwrap();
    assert_eq!(restored.turns()[0].text(), Some("remember me"));
    let before = restored.turns().len();

    second.submit("s", "and again").await.unwrap();
    let after = second.session("s").await.unwrap().unwrap();
    assert!(after.turns().len() > before);

    second.end_session("s").await.unwrap();
    let ended = second.session("s").await.unwrap().unwrap();
    assert_eq!(
        ended.status,
        SessionStatus::Terminated { reason: TerminationReason::EndSignal }
    );
}
