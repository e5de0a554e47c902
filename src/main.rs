//! Hive - 交互式命令行
//!
//! 入口：初始化日志、加载配置、创建 Orchestrator，并在 stdin 上运行 REPL。
//! 普通输入提交给当前会话；命令：/approve <id>、/deny <id> [reason]、/cancel、/end、/new、/quit。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::config::{load_config, AppConfig};
use hive::core::OrchestratorBuilder;
use hive::react::{ReactEvent, Termination};
use hive::supervisor::{ApprovalDecision, InMemoryApprovalChannel};
use hive::Orchestrator;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let channel = Arc::new(InMemoryApprovalChannel::new());
    let orchestrator = Arc::new(
        OrchestratorBuilder::from_config(&cfg)
            .and_then(|b| b.approvals(channel.clone()).build())
            .context("Failed to create orchestrator")?,
    );

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ReactEvent>();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(event);
        }
    });

    let mut session_id = new_session_id();
    println!(
        "{} ready (session {session_id}). Commands: /approve <id>, /deny <id> [reason], /cancel, /end, /new, /quit",
        cfg.app.name.as_deref().unwrap_or("hive")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("stdin read failed")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("/quit"), _, _) => break,
            (Some("/cancel"), _, _) => {
                if !orchestrator.cancel(&session_id) {
                    println!("(nothing to cancel)");
                }
            }
            (Some("/end"), _, _) => match orchestrator.end_session(&session_id).await {
                Ok(()) => println!("Session {session_id} ended. Use /new to start another."),
                Err(e) => println!("Error: {e}"),
            },
            (Some("/new"), _, _) => {
                session_id = new_session_id();
                println!("New session {session_id}");
            }
            (Some(cmd @ ("/approve" | "/deny")), Some(id), rationale) => {
                let decision = if cmd == "/approve" {
                    ApprovalDecision::approve(id)
                } else {
                    ApprovalDecision::deny(id)
                };
                let decision = match rationale {
                    Some(r) => decision.with_rationale(r),
                    None => decision,
                };
                if let Err(e) = channel.decide(decision) {
                    println!("Error: {e}");
                    continue;
                }
                let orchestrator = orchestrator.clone();
                let tx = event_tx.clone();
                let sid = session_id.clone();
                tokio::spawn(async move {
                    report(orchestrator.await_decision(&sid, Some(&tx)).await);
                });
            }
            (Some("/approve" | "/deny"), None, _) => println!("Usage: /approve <id> | /deny <id> [reason]"),
            _ => {
                let orchestrator = orchestrator.clone();
                let tx = event_tx.clone();
                let sid = session_id.clone();
                let input = line.to_string();
                tokio::spawn(async move {
                    report(submit(&orchestrator, &sid, &input, &tx).await);
                });
            }
        }
    }

    orchestrator.shutdown();
    Ok(())
}

async fn submit(
    orchestrator: &Orchestrator,
    session_id: &str,
    input: &str,
    tx: &mpsc::UnboundedSender<ReactEvent>,
) -> Result<hive::FinalResponse, hive::RunFailure> {
    orchestrator.submit_with_events(session_id, input, Some(tx)).await
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn report(result: Result<hive::FinalResponse, hive::RunFailure>) {
    match result {
        Ok(resp) => match resp.termination {
            Termination::Completed | Termination::AwaitingApproval(_) => {}
            other => println!("({} after {} step(s))", other.as_str(), resp.steps),
        },
        Err(failure) => {
            println!("Error: {}", failure.error);
            tracing::debug!(turns = failure.trace.len(), "partial trace returned with failure");
        }
    }
}

fn print_event(event: ReactEvent) {
    match event {
        ReactEvent::ToolCall { tool, correlation_id, args } => {
            println!("  -> {tool} [{correlation_id}] {args}");
        }
        ReactEvent::Observation { tool, ok, preview, .. } => {
            let mark = if ok { "ok" } else { "failed" };
            println!("  <- {tool} {mark}: {preview}");
        }
        ReactEvent::Retrieval { query, hits, .. } => println!("  (retrieved {hits} hit(s) for \"{query}\")"),
        ReactEvent::Delegation { agent_id, depth, .. } => println!("  (delegating to {agent_id}, depth {depth})"),
        ReactEvent::ApprovalRequested { correlation_id, action, description } => {
            println!("Approval required for `{action}`: {description}");
            println!("  /approve {correlation_id}   or   /deny {correlation_id} [reason]");
        }
        ReactEvent::MessageChunk { text } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        ReactEvent::MessageDone => println!(),
        ReactEvent::Error { text } => println!("Error: {text}"),
        _ => {}
    }
}
