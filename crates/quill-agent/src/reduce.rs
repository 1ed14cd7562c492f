//! The event dispatcher: a reducer over `(CoordinatorState, EngineEvent)`.
//!
//! `reduce` and the caller-operation functions below are the only mutators
//! of session state. They return `Effect`s instead of performing side
//! effects; the coordinator interprets those after the transition applied.

use serde_json::Value;

use crate::compact::{self, CompactionOutcome};
use crate::effect::{Effect, Notification};
use crate::engine::TaskContext;
use crate::error::{Error, Result};
use crate::event::{EngineEvent, QueueSnapshot, ToolCallInfo, TokenUsage};
use crate::session::{
    streaming_placeholder_id, AgentSession, AgentTag, Message, Role, TaskInput,
};
use crate::state::{
    AgentStatus, CoordinatorState, LlmRetryState, PendingToolApproval, ReasoningStatus,
    RequestTiming,
};
use crate::types::{RequestId, SessionId};

pub fn reduce(state: &mut CoordinatorState, event: EngineEvent) -> Vec<Effect> {
    // Events addressed to a session other than the one on screen update
    // that session's message log without touching live streaming state.
    if let Some(target) = event.session_id() {
        if target != state.current_session_id() {
            return handle_background_event(state, target, event);
        }
    }

    match event {
        EngineEvent::RunStarted => handle_run_started(state),
        EngineEvent::RunPaused => set_status(state, AgentStatus::WaitingApproval),
        EngineEvent::RunResumed => set_status(state, AgentStatus::Running),
        EngineEvent::RunCompleted => handle_run_completed(state),
        EngineEvent::RunFailed { error } => handle_run_failure(state, error),
        EngineEvent::RunAborted => handle_run_aborted(state),
        EngineEvent::TextDelta { delta, .. } => handle_text_delta(state, &delta),
        EngineEvent::ReasoningDelta { content } => handle_reasoning_delta(state, &content),
        EngineEvent::ReasoningDone => {
            state.streaming_reasoning_status = ReasoningStatus::Done;
            vec![]
        }
        EngineEvent::TextFinal { text, .. } => handle_text_final(state, text),
        EngineEvent::ToolStart { tool, .. } => handle_tool_start(state, &tool),
        EngineEvent::ToolResult { tool, output, .. } => handle_tool_result(state, &tool, &output),
        EngineEvent::ToolError { tool, error } => handle_tool_error(state, &tool, &error),
        EngineEvent::PermissionAsked {
            permission,
            metadata,
        } => handle_permission_asked(state, &permission, &metadata),
        EngineEvent::PermissionReplied => {
            state.pending_approval = None;
            vec![]
        }
        EngineEvent::QueueUpdated {
            running,
            active_task,
            queued,
        } => {
            state.queue = QueueSnapshot {
                running,
                active_task,
                queued,
            };
            vec![Effect::Notify(Notification::QueueChanged)]
        }
        EngineEvent::StepFinish { tokens } => handle_step_finish(state, tokens),
        EngineEvent::MessageChunk { content, agent } => {
            handle_message_chunk(state, &content, agent)
        }
        EngineEvent::Complete { result, .. } => handle_complete(state, result),
        EngineEvent::Error { message, .. } => handle_run_failure(state, message),
        EngineEvent::LlmRequestStart {
            request_id,
            timestamp,
        } => {
            state.inflight_request = Some(RequestTiming {
                request_id,
                started_at: timestamp,
            });
            vec![]
        }
        EngineEvent::LlmRequestEnd => {
            state.clear_request_tracking();
            vec![]
        }
        EngineEvent::LlmRetryScheduled {
            request_id,
            attempt,
            max_retries,
            delay_ms,
            reason,
            next_retry_at,
        } => {
            state.retry = Some(LlmRetryState {
                request_id,
                attempt,
                max_retries,
                delay_ms,
                reason,
                next_retry_at,
            });
            vec![]
        }
        EngineEvent::Heartbeat { timestamp } => {
            state.last_heartbeat_at = Some(timestamp);
            vec![]
        }
        EngineEvent::CompactionReady {
            session_id,
            base_len,
            summary,
            tail,
        } => handle_compaction_ready(state, session_id, base_len, summary, tail),
        EngineEvent::CompactionFailed { session_id, error } => {
            state.is_compacting = false;
            state.pending_compaction = true;
            tracing::warn!(%session_id, %error, "compaction failed; will retry on next trigger");
            vec![]
        }
    }
}

fn set_status(state: &mut CoordinatorState, status: AgentStatus) -> Vec<Effect> {
    state.status = status;
    vec![Effect::Notify(Notification::StatusChanged(status))]
}

fn handle_run_started(state: &mut CoordinatorState) -> Vec<Effect> {
    state.error = None;
    state.reset_streaming();
    // A model without a thinking stream never leaves Done, so text deltas
    // need no reasoning bookkeeping.
    state.streaming_reasoning_status = if state.config.thinking_stream {
        ReasoningStatus::Idle
    } else {
        ReasoningStatus::Done
    };
    set_status(state, AgentStatus::Running)
}

fn handle_run_completed(state: &mut CoordinatorState) -> Vec<Effect> {
    state.clear_request_tracking();
    let mut effects = set_status(state, AgentStatus::Completed);
    effects.extend(compaction_effects(state));
    effects.push(Effect::PersistSessions);
    effects
}

fn handle_run_failure(state: &mut CoordinatorState, error: String) -> Vec<Effect> {
    state.error = Some(error);
    state.lifetime_stats.tasks_failed += 1;
    state.clear_request_tracking();
    let mut effects = set_status(state, AgentStatus::Error);
    effects.push(Effect::PersistSessions);
    effects
}

fn handle_run_aborted(state: &mut CoordinatorState) -> Vec<Effect> {
    state.reset_streaming();
    state.pending_approval = None;
    state.clear_request_tracking();
    set_status(state, AgentStatus::Aborted)
}

fn handle_text_delta(state: &mut CoordinatorState, delta: &str) -> Vec<Effect> {
    // Reasoning is assumed to finish before the answer begins.
    if !state.streaming_reasoning.is_empty()
        && state.streaming_reasoning_status == ReasoningStatus::Streaming
    {
        state.streaming_reasoning_status = ReasoningStatus::Done;
    }
    state.streaming_content.push_str(delta);
    vec![]
}

fn handle_reasoning_delta(state: &mut CoordinatorState, content: &str) -> Vec<Effect> {
    state.streaming_reasoning.push_str(content);
    state.streaming_reasoning_status = ReasoningStatus::Streaming;
    vec![]
}

fn handle_text_final(state: &mut CoordinatorState, text: String) -> Vec<Effect> {
    // The final text is authoritative; the accumulated buffer is discarded.
    let reasoning = std::mem::take(&mut state.streaming_reasoning);
    let agent = state.streaming_agent.take();
    state.reset_streaming();

    let content = compose_final(&reasoning, &text);
    if content.trim().is_empty() {
        return vec![];
    }

    let session_id = state.current_session_id();
    let mut message = Message::assistant(content);
    message.agent_tag = agent;
    state.current_session_mut().push_message(message);

    vec![
        Effect::Notify(Notification::MessageAppended(session_id)),
        Effect::PersistSessions,
    ]
}

/// Renders reasoning + answer as one message; with no visible answer the
/// reasoning block alone constitutes the message.
pub fn compose_final(reasoning: &str, content: &str) -> String {
    let reasoning = reasoning.trim();
    if reasoning.is_empty() {
        return content.to_string();
    }
    let block = format!("[reasoning]\n{reasoning}\n[/reasoning]");
    if content.trim().is_empty() {
        block
    } else {
        format!("{block}\n\n{content}")
    }
}

// Any non-empty streaming buffer becomes a completed assistant message
// before a tool or session-boundary message lands.
fn flush_streaming(state: &mut CoordinatorState) -> Option<SessionId> {
    let composed = compose_final(&state.streaming_reasoning, &state.streaming_content);
    if composed.trim().is_empty() {
        return None;
    }
    let agent = state.streaming_agent;
    state.reset_streaming();

    let session_id = state.current_session_id();
    let mut message = Message::assistant(composed);
    message.agent_tag = agent;
    state.current_session_mut().push_message(message);
    Some(session_id)
}

fn tool_invocation_text(tool: &ToolCallInfo) -> String {
    let params = serde_json::to_string(&tool.params).unwrap_or_else(|_| "{}".to_string());
    format!("Running {}({params})", tool.name)
}

fn handle_tool_start(state: &mut CoordinatorState, tool: &ToolCallInfo) -> Vec<Effect> {
    let mut effects = Vec::new();
    if let Some(session_id) = flush_streaming(state) {
        effects.push(Effect::Notify(Notification::MessageAppended(session_id)));
    }

    let session_id = state.current_session_id();
    state
        .current_session_mut()
        .push_message(Message::tool(tool_invocation_text(tool)));
    state.task_stats.tool_calls += 1;
    state.lifetime_stats.tool_calls += 1;

    effects.push(Effect::Notify(Notification::MessageAppended(session_id)));
    effects
}

fn handle_tool_result(state: &mut CoordinatorState, tool: &str, output: &str) -> Vec<Effect> {
    let mut effects = Vec::new();
    if let Some(session_id) = flush_streaming(state) {
        effects.push(Effect::Notify(Notification::MessageAppended(session_id)));
    }

    let session_id = state.current_session_id();
    state
        .current_session_mut()
        .push_message(Message::tool(format!("[{tool}] {output}")));
    state.task_stats.tool_successes += 1;
    state.lifetime_stats.tool_successes += 1;

    effects.push(Effect::Notify(Notification::MessageAppended(session_id)));
    effects
}

fn handle_tool_error(state: &mut CoordinatorState, tool: &str, error: &str) -> Vec<Effect> {
    let mut effects = Vec::new();
    if let Some(session_id) = flush_streaming(state) {
        effects.push(Effect::Notify(Notification::MessageAppended(session_id)));
    }

    let session_id = state.current_session_id();
    state
        .current_session_mut()
        .push_message(Message::tool(format!("[{tool}] failed: {error}")));
    state.task_stats.tool_failures += 1;
    state.lifetime_stats.tool_failures += 1;

    effects.push(Effect::Notify(Notification::MessageAppended(session_id)));
    effects
}

fn parse_permission(permission: &str, metadata: &Value) -> PendingToolApproval {
    let request_id = metadata
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or(permission);
    let name = metadata
        .get("tool")
        .and_then(Value::as_str)
        .unwrap_or(permission);
    let params = metadata
        .get("params")
        .and_then(Value::as_object)
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    PendingToolApproval {
        tool: ToolCallInfo {
            id: request_id.to_string(),
            name: name.to_string(),
            params,
        },
        request_id: RequestId::new(request_id),
    }
}

fn handle_permission_asked(
    state: &mut CoordinatorState,
    permission: &str,
    metadata: &Value,
) -> Vec<Effect> {
    let pending = parse_permission(permission, metadata);
    if let Some(previous) = &state.pending_approval {
        tracing::warn!(
            previous = %previous.request_id,
            replacement = %pending.request_id,
            "replacing pending approval; last request wins"
        );
    }
    let request_id = pending.request_id.clone();
    state.pending_approval = Some(pending);

    let mut effects = set_status(state, AgentStatus::WaitingApproval);
    effects.push(Effect::Notify(Notification::ApprovalRequested(request_id)));
    effects
}

fn handle_step_finish(state: &mut CoordinatorState, tokens: TokenUsage) -> Vec<Effect> {
    let session = state.current_session_mut();
    session.total_tokens_used += tokens.input + tokens.output;
    session.touch();
    vec![]
}

fn handle_message_chunk(
    state: &mut CoordinatorState,
    content: &str,
    agent: AgentTag,
) -> Vec<Effect> {
    let mut effects = Vec::new();
    // A different sub-agent starts speaking: close out the previous one's
    // buffer under its own attribution first.
    let switching = state.streaming_agent.is_some_and(|prev| prev != agent);
    if switching && !state.streaming_content.is_empty() {
        if let Some(session_id) = flush_streaming(state) {
            effects.push(Effect::Notify(Notification::MessageAppended(session_id)));
        }
    }
    state.streaming_agent = Some(agent);
    state.streaming_content.push_str(content);
    effects
}

fn handle_complete(state: &mut CoordinatorState, result: String) -> Vec<Effect> {
    let mut effects = Vec::new();
    if let Some(session_id) = flush_streaming(state) {
        effects.push(Effect::Notify(Notification::MessageAppended(session_id)));
    }

    // The counter moves once per event even when the message is a duplicate.
    state.lifetime_stats.tasks_completed += 1;

    let session_id = state.current_session_id();
    let duplicate = state
        .current_session()
        .messages
        .last()
        .is_some_and(|m| m.role == Role::Assistant && m.content == result);
    if !duplicate {
        state
            .current_session_mut()
            .push_message(Message::assistant(result));
        effects.push(Effect::Notify(Notification::MessageAppended(session_id)));
    }

    effects.extend(set_status(state, AgentStatus::Completed));
    effects.push(Effect::PersistSessions);
    effects
}

// At most one summarization in flight; pending_compaction holds the retry.
fn compaction_effects(state: &mut CoordinatorState) -> Vec<Effect> {
    let window = state.config.resolved_context_window();
    if compact::over_budget(state.current_session(), window) {
        state.pending_compaction = true;
    }

    if state.pending_compaction && !state.is_compacting {
        match compact::plan_compaction(state.current_session()) {
            Some(plan) => {
                state.is_compacting = true;
                return vec![Effect::RequestCompaction { plan }];
            }
            None => state.pending_compaction = false,
        }
    }
    vec![]
}

fn handle_compaction_ready(
    state: &mut CoordinatorState,
    session_id: SessionId,
    base_len: usize,
    summary: String,
    tail: Vec<Message>,
) -> Vec<Effect> {
    state.is_compacting = false;

    if session_id != state.current_session_id() {
        tracing::debug!(%session_id, "discarding compaction result; session changed");
        state.pending_compaction = true;
        return vec![];
    }

    match compact::apply_summary(state.current_session_mut(), base_len, summary, tail) {
        CompactionOutcome::Committed { newer_arrived } => {
            state.pending_compaction = newer_arrived;
            vec![
                Effect::Notify(Notification::MessageAppended(session_id)),
                Effect::PersistSessions,
            ]
        }
        CompactionOutcome::ConcurrentReset => {
            tracing::debug!(%session_id, "discarding compaction result; conversation was reset");
            state.pending_compaction = true;
            vec![]
        }
    }
}

// ---------------------------------------------------------------------------
// Background sessions
// ---------------------------------------------------------------------------

// Reduced vocabulary for sessions not on screen: the message log stays
// current, live streaming buffers stay untouched, duplicates are no-ops.
fn handle_background_event(
    state: &mut CoordinatorState,
    target: SessionId,
    event: EngineEvent,
) -> Vec<Effect> {
    let Some(session) = state.session_mut(target) else {
        tracing::debug!(%target, "dropping event for unknown session");
        return vec![];
    };

    let persist = match event {
        EngineEvent::TextDelta { delta, .. } => {
            append_background_delta(session, target, &delta);
            false
        }
        EngineEvent::TextFinal { text, .. } => finalize_background_stream(session, target, text),
        EngineEvent::ToolStart { tool, .. } => {
            push_unless_duplicate(session, Message::tool(tool_invocation_text(&tool)))
        }
        EngineEvent::ToolResult { tool, output, .. } => {
            push_unless_duplicate(session, Message::tool(format!("[{tool}] {output}")))
        }
        EngineEvent::Complete { result, .. } => finalize_background_stream(session, target, result),
        EngineEvent::Error { message, .. } => {
            push_unless_duplicate(session, Message::system(format!("Error: {message}")))
        }
        other => {
            tracing::debug!(%target, event = ?other, "unsupported background event");
            return vec![];
        }
    };

    let mut effects = vec![Effect::Notify(Notification::MessageAppended(target))];
    if persist {
        effects.push(Effect::PersistSessions);
    }
    effects
}

fn append_background_delta(session: &mut AgentSession, target: SessionId, delta: &str) {
    let placeholder = streaming_placeholder_id(target);
    if let Some(message) = session
        .messages
        .iter_mut()
        .find(|m| m.id.as_deref() == Some(placeholder.as_str()))
    {
        message.content.push_str(delta);
    } else {
        let mut message = Message::assistant(delta);
        message.id = Some(placeholder);
        session.messages.push(message);
    }
    session.touch();
}

fn finalize_background_stream(
    session: &mut AgentSession,
    target: SessionId,
    text: String,
) -> bool {
    let placeholder = streaming_placeholder_id(target);
    if let Some(message) = session
        .messages
        .iter_mut()
        .find(|m| m.id.as_deref() == Some(placeholder.as_str()))
    {
        message.content = text;
        message.id = None;
        session.touch();
        return true;
    }
    push_unless_duplicate(session, Message::assistant(text))
}

fn push_unless_duplicate(session: &mut AgentSession, message: Message) -> bool {
    if session.messages.last() == Some(&message) {
        return false;
    }
    session.push_message(message);
    true
}

// ---------------------------------------------------------------------------
// Caller operations
// ---------------------------------------------------------------------------

/// Submits a task. An idle session gets a full per-task reset; a busy one
/// coalesces the new turn into the in-flight run.
pub fn start_task(
    state: &mut CoordinatorState,
    input: TaskInput,
    mut context: TaskContext,
) -> Vec<Effect> {
    if let Err(e) = state.config.validate() {
        state.error = Some(e.to_string());
        return set_status(state, AgentStatus::Error);
    }

    let coalescing = matches!(
        state.status,
        AgentStatus::Running | AgentStatus::WaitingApproval
    );
    if !coalescing {
        state.reset_task_state();
        state.status = AgentStatus::Running;
    }

    context.history = history_for_context(state);

    let mut message = Message::user(input.text.clone());
    message.raw_content = input.raw_text.clone();
    message.attachments = input.attachments.clone();

    let session_id = state.current_session_id();
    {
        let session = state.current_session_mut();
        session.adopt_title(&input.text);
        session.push_message(message);
    }

    let mut effects = Vec::new();
    if !coalescing {
        effects.push(Effect::Notify(Notification::StatusChanged(
            AgentStatus::Running,
        )));
    }
    effects.push(Effect::Notify(Notification::MessageAppended(session_id)));
    effects.push(Effect::SendTask {
        task: input,
        context,
    });
    effects.push(Effect::PersistSessions);
    effects
}

/// Prior turns forwarded to the engine: user/assistant roles only.
fn history_for_context(state: &CoordinatorState) -> Vec<Message> {
    state
        .current_session()
        .messages
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .cloned()
        .collect()
}

/// Aborts the run. An in-flight compaction cannot be cancelled; the commit
/// race check discards its late result.
pub fn abort(state: &mut CoordinatorState) -> Vec<Effect> {
    state.reset_streaming();
    state.pending_approval = None;
    state.clear_request_tracking();
    state.last_heartbeat_at = None;

    let mut effects = vec![Effect::AbortRun];
    effects.extend(set_status(state, AgentStatus::Aborted));
    effects
}

/// Answers the outstanding approval request. The clear is optimistic; the
/// engine stays the source of truth.
pub fn resolve_pending_approval(state: &mut CoordinatorState, approved: bool) -> Vec<Effect> {
    let Some(pending) = state.pending_approval.take() else {
        tracing::warn!("approve/reject with no pending approval; ignoring");
        return vec![];
    };
    vec![Effect::ReplyPermission {
        request_id: pending.request_id,
        approved,
    }]
}

/// Caller-driven escape hatch for a stuck request; timeouts are
/// observer-only, so this just clears the tracking.
pub fn retry_timeout(state: &mut CoordinatorState) -> Vec<Effect> {
    if state.inflight_request.is_none() && state.retry.is_none() {
        return vec![];
    }
    tracing::warn!("retry timeout requested; clearing request tracking");
    state.clear_request_tracking();
    vec![]
}

// ---------------------------------------------------------------------------
// Session manager operations
// ---------------------------------------------------------------------------

fn leave_current_session(state: &mut CoordinatorState) {
    // Flush-before-switch: live buffers become a real message in the old
    // session; all transient state resets at the boundary.
    flush_streaming(state);
    state.reset_task_state();
    state.status = AgentStatus::Idle;
    state.is_compacting = false;
    state.pending_compaction = false;
}

fn session_list_effects() -> Vec<Effect> {
    vec![
        Effect::Notify(Notification::SessionListChanged),
        Effect::PersistSessions,
        Effect::SyncSessions,
    ]
}

pub fn create_session(state: &mut CoordinatorState) -> Vec<Effect> {
    leave_current_session(state);
    state.sessions.push(AgentSession::new());
    state.current_index = state.sessions.len() - 1;
    session_list_effects()
}

pub fn switch_session(state: &mut CoordinatorState, id: SessionId) -> Result<Vec<Effect>> {
    let index = state
        .session_index(id)
        .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
    if index == state.current_index {
        return Ok(vec![]);
    }
    leave_current_session(state);
    state.current_index = index;
    Ok(session_list_effects())
}

/// Deletes a session; the list is never left empty.
pub fn delete_session(state: &mut CoordinatorState, id: SessionId) -> Result<Vec<Effect>> {
    let index = state
        .session_index(id)
        .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
    let was_current = index == state.current_index;

    state.sessions.remove(index);
    if state.sessions.is_empty() {
        state.sessions.push(AgentSession::new());
        state.current_index = 0;
    } else if was_current {
        state.current_index = 0;
    } else if index < state.current_index {
        state.current_index -= 1;
    }

    if was_current {
        state.reset_task_state();
        state.status = AgentStatus::Idle;
        state.is_compacting = false;
        state.pending_compaction = false;
    }

    Ok(session_list_effects())
}

pub fn rename_session(
    state: &mut CoordinatorState,
    id: SessionId,
    title: impl Into<String>,
) -> Result<Vec<Effect>> {
    let session = state
        .session_mut(id)
        .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
    session.title = title.into();
    session.touch();
    Ok(session_list_effects())
}
