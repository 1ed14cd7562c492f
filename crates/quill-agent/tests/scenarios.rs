//! End-to-end flows through the coordinator: tasks, tool runs with
//! approvals, background sessions, compaction, and persistence across a
//! restart.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Mutex;

use quill_agent::compact::COMPACT_KEEP_RECENT;
use quill_agent::coordinator::Coordinator;
use quill_agent::engine::{ExecutionEngine, NullSync, Summarizer, TaskContext};
use quill_agent::event::{EngineEvent, QueueSnapshot, ToolCallInfo};
use quill_agent::store::{InMemorySessionStore, JsonSessionStore, SessionStore};
use quill_agent::types::RequestId;
use quill_agent::{AgentConfig, AgentStatus, Result, Role, TaskInput};

#[derive(Default)]
struct ScriptedEngine {
    tasks: Mutex<Vec<String>>,
    replies: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    async fn start_task(
        &self,
        _config: &AgentConfig,
        task: &TaskInput,
        _context: &TaskContext,
    ) -> Result<()> {
        self.tasks.lock().await.push(task.text.clone());
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        Ok(())
    }

    async fn approve_or_reject_tool(&self, request_id: &RequestId, approved: bool) -> Result<()> {
        self.replies
            .lock()
            .await
            .push((request_id.as_str().to_string(), approved));
        Ok(())
    }

    async fn enable_debug(&self, _workspace_path: &str) -> Result<String> {
        Ok("ws://127.0.0.1:9229".to_string())
    }

    async fn disable_debug(&self) -> Result<()> {
        Ok(())
    }

    async fn queue_status(&self) -> Result<QueueSnapshot> {
        Ok(QueueSnapshot::default())
    }
}

struct FixedSummarizer(&'static str);

#[async_trait]
impl Summarizer for FixedSummarizer {
    async fn summarize(
        &self,
        _prompt: &str,
        _temperature: f32,
        _max_tokens: usize,
    ) -> Result<String> {
        Ok(self.0.to_string())
    }
}

fn test_config() -> AgentConfig {
    AgentConfig {
        api_key: "sk-test".to_string(),
        // Small window so the compaction scenario can trip the threshold
        // with reasonably sized transcripts.
        context_window: Some(8_000),
        ..AgentConfig::default()
    }
}

async fn test_coordinator(store: Arc<dyn SessionStore>) -> (Coordinator, Arc<ScriptedEngine>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
        )
        .try_init();

    let engine = Arc::new(ScriptedEngine::default());
    let coordinator = Coordinator::new(
        test_config(),
        Arc::clone(&engine) as Arc<dyn ExecutionEngine>,
        Arc::new(FixedSummarizer("the earlier conversation, condensed")),
        Arc::new(NullSync),
        store,
    )
    .await
    .unwrap();
    (coordinator, engine)
}

async fn dispatch_all(coordinator: &mut Coordinator, events: Vec<EngineEvent>) {
    for event in events {
        coordinator.dispatch(event).await;
    }
}

#[tokio::test]
async fn test_simple_turn_builds_transcript() {
    let (mut coordinator, engine) =
        test_coordinator(Arc::new(InMemorySessionStore::default())).await;

    coordinator
        .start_task(TaskInput::text("what did I write yesterday?"), TaskContext::default())
        .await;
    assert_eq!(
        engine.tasks.lock().await.as_slice(),
        ["what did I write yesterday?"]
    );

    dispatch_all(
        &mut coordinator,
        vec![
            EngineEvent::RunStarted,
            EngineEvent::TextDelta {
                delta: "You wrote".to_string(),
                session_id: None,
            },
            EngineEvent::TextDelta {
                delta: " two notes.".to_string(),
                session_id: None,
            },
            EngineEvent::TextFinal {
                text: "You wrote two notes.".to_string(),
                session_id: None,
            },
            EngineEvent::RunCompleted,
        ],
    )
    .await;

    let state = coordinator.state();
    assert_eq!(state.status, AgentStatus::Completed);
    let messages = &state.current_session().messages;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "You wrote two notes.");
    assert!(state.streaming_content.is_empty());
    assert_eq!(state.current_session().title, "what did I write yesterday?");
}

#[tokio::test]
async fn test_tool_turn_with_approval() {
    let (mut coordinator, engine) =
        test_coordinator(Arc::new(InMemorySessionStore::default())).await;

    coordinator
        .start_task(TaskInput::text("rename that note"), TaskContext::default())
        .await;
    dispatch_all(
        &mut coordinator,
        vec![
            EngineEvent::RunStarted,
            EngineEvent::TextDelta {
                delta: "I'll rename it.".to_string(),
                session_id: None,
            },
            EngineEvent::PermissionAsked {
                permission: "fs.rename".to_string(),
                metadata: json!({"request_id": "req-7", "tool": "rename_note"}),
            },
        ],
    )
    .await;

    assert_eq!(coordinator.state().status, AgentStatus::WaitingApproval);
    coordinator.approve_tool().await;
    assert_eq!(
        engine.replies.lock().await.as_slice(),
        [("req-7".to_string(), true)]
    );

    dispatch_all(
        &mut coordinator,
        vec![
            EngineEvent::PermissionReplied,
            EngineEvent::RunResumed,
            EngineEvent::ToolStart {
                tool: ToolCallInfo {
                    id: "tc-1".to_string(),
                    name: "rename_note".to_string(),
                    params: Default::default(),
                },
                session_id: None,
            },
            EngineEvent::ToolResult {
                tool: "rename_note".to_string(),
                output: "renamed".to_string(),
                session_id: None,
            },
            EngineEvent::Complete {
                result: "Done, the note is renamed.".to_string(),
                session_id: None,
            },
            EngineEvent::RunCompleted,
        ],
    )
    .await;

    let state = coordinator.state();
    assert_eq!(state.status, AgentStatus::Completed);
    assert_eq!(state.task_stats.tool_calls, 1);
    assert_eq!(state.task_stats.tool_successes, 1);

    // The streamed preamble was flushed before the tool message.
    let roles: Vec<Role> = state
        .current_session()
        .messages
        .iter()
        .map(|m| m.role)
        .collect();
    assert_eq!(
        roles,
        [Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Assistant]
    );
}

#[tokio::test]
async fn test_rejected_tool_reaches_engine_as_denial() {
    let (mut coordinator, engine) =
        test_coordinator(Arc::new(InMemorySessionStore::default())).await;

    dispatch_all(
        &mut coordinator,
        vec![EngineEvent::PermissionAsked {
            permission: "shell.exec".to_string(),
            metadata: json!({"request_id": "req-9"}),
        }],
    )
    .await;
    coordinator.reject_tool().await;

    assert_eq!(
        engine.replies.lock().await.as_slice(),
        [("req-9".to_string(), false)]
    );
    assert!(coordinator.state().pending_approval.is_none());
}

#[tokio::test]
async fn test_background_session_keeps_streaming_while_user_switches() {
    let (mut coordinator, _engine) =
        test_coordinator(Arc::new(InMemorySessionStore::default())).await;

    let busy = coordinator.current_session_id();
    coordinator
        .start_task(TaskInput::text("long research task"), TaskContext::default())
        .await;
    coordinator.dispatch(EngineEvent::RunStarted).await;

    // The user opens a fresh session while the old one keeps working.
    let fresh = coordinator.create_session().await;
    assert_ne!(busy, fresh);

    dispatch_all(
        &mut coordinator,
        vec![
            EngineEvent::TextDelta {
                delta: "Findings so far".to_string(),
                session_id: Some(busy),
            },
            EngineEvent::Complete {
                result: "Findings so far, in full.".to_string(),
                session_id: Some(busy),
            },
        ],
    )
    .await;

    // The fresh session saw none of it.
    assert!(coordinator.state().current_session().messages.is_empty());

    coordinator.switch_session(busy).await.unwrap();
    let state = coordinator.state();
    let last = state.current_session().messages.last().unwrap();
    assert_eq!(last.content, "Findings so far, in full.");
    assert!(last.id.is_none());
}

#[tokio::test]
async fn test_compaction_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.json");

    let session_id;
    {
        let store = Arc::new(JsonSessionStore::new(&path));
        let (mut coordinator, _engine) = test_coordinator(store).await;
        session_id = coordinator.current_session_id();

        coordinator
            .start_task(TaskInput::text("summarize everything"), TaskContext::default())
            .await;
        let mut events = vec![EngineEvent::RunStarted];
        for i in 0..10 {
            events.push(EngineEvent::TextFinal {
                text: format!("{i}: {}", "x".repeat(20_000)),
                session_id: None,
            });
        }
        events.push(EngineEvent::RunCompleted);
        dispatch_all(&mut coordinator, events).await;
        assert!(coordinator.state().is_compacting);

        // Let the summarization land, then route it back through the loop.
        coordinator.pump().await;
        while coordinator.state().is_compacting {
            tokio::task::yield_now().await;
            coordinator.pump().await;
        }
    }

    let store = Arc::new(JsonSessionStore::new(&path));
    let (coordinator, _engine) = test_coordinator(store).await;
    let state = coordinator.state();

    assert_eq!(state.current_session_id(), session_id);
    let messages = &state.current_session().messages;
    assert_eq!(messages.len(), 1 + COMPACT_KEEP_RECENT);
    assert!(messages[0].is_summary());
    assert!(messages[0]
        .content
        .contains("the earlier conversation, condensed"));
    assert!(!state.pending_compaction);
}

#[tokio::test]
async fn test_retry_and_heartbeat_are_visible_then_cleared() {
    let (mut coordinator, _engine) =
        test_coordinator(Arc::new(InMemorySessionStore::default())).await;

    dispatch_all(
        &mut coordinator,
        vec![
            EngineEvent::RunStarted,
            EngineEvent::LlmRequestStart {
                request_id: "req-1".to_string(),
                timestamp: 1_000,
            },
            EngineEvent::LlmRetryScheduled {
                request_id: "req-1".to_string(),
                attempt: 2,
                max_retries: 5,
                delay_ms: 4_000,
                reason: "overloaded".to_string(),
                next_retry_at: 5_000,
            },
            EngineEvent::Heartbeat { timestamp: 2_000 },
        ],
    )
    .await;

    let state = coordinator.state();
    assert_eq!(state.retry.as_ref().unwrap().attempt, 2);
    assert_eq!(state.last_heartbeat_at, Some(2_000));
    assert!(state.connection_healthy(3_000));
    assert!(!state.connection_healthy(60_000));

    dispatch_all(
        &mut coordinator,
        vec![EngineEvent::LlmRequestEnd, EngineEvent::RunCompleted],
    )
    .await;
    let state = coordinator.state();
    assert!(state.retry.is_none());
    assert!(state.inflight_request.is_none());
}

#[tokio::test]
async fn test_failed_run_then_fresh_task_recovers() {
    let (mut coordinator, _engine) =
        test_coordinator(Arc::new(InMemorySessionStore::default())).await;

    coordinator
        .start_task(TaskInput::text("first"), TaskContext::default())
        .await;
    dispatch_all(
        &mut coordinator,
        vec![
            EngineEvent::RunStarted,
            EngineEvent::RunFailed {
                error: "provider unavailable".to_string(),
            },
        ],
    )
    .await;
    assert_eq!(coordinator.state().status, AgentStatus::Error);

    coordinator
        .start_task(TaskInput::text("try again"), TaskContext::default())
        .await;
    let state = coordinator.state();
    assert_eq!(state.status, AgentStatus::Running);
    assert!(state.error.is_none());
    assert_eq!(state.lifetime_stats.tasks_failed, 1);
}
