use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::event::{QueueSnapshot, ToolCallInfo};
use crate::session::{AgentSession, AgentTag};
use crate::types::{RequestId, SessionId};

/// Heartbeats older than this mark the engine connection unhealthy.
pub const HEARTBEAT_STALE_MS: u64 = 30_000;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Running,
    WaitingApproval,
    Completed,
    Error,
    Aborted,
}

/// Counters for the task currently in flight. Reset on every non-coalesced
/// `start_task`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub tool_calls: u64,
    pub tool_successes: u64,
    pub tool_failures: u64,
}

/// Monotonically non-decreasing counters across the life of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifetimeStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tool_calls: u64,
    pub tool_successes: u64,
    pub tool_failures: u64,
}

/// At most one approval request is outstanding; a newer `permission_asked`
/// overwrites it (last request wins).
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolApproval {
    pub tool: ToolCallInfo,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmRetryState {
    pub request_id: String,
    pub attempt: u32,
    pub max_retries: u32,
    pub delay_ms: u64,
    pub reason: String,
    pub next_retry_at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestTiming {
    pub request_id: String,
    pub started_at: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReasoningStatus {
    #[default]
    Idle,
    Streaming,
    Done,
}

/// The whole coordinator state. The reducer in `reduce` is its sole mutator.
#[derive(Debug, Clone)]
pub struct CoordinatorState {
    pub config: AgentConfig,

    /// Session arena plus the index of the one on screen. Session-scoped
    /// operations resolve through the index, never retained references.
    pub sessions: Vec<AgentSession>,
    pub current_index: usize,

    pub status: AgentStatus,
    pub error: Option<String>,

    pub streaming_content: String,
    pub streaming_reasoning: String,
    pub streaming_reasoning_status: ReasoningStatus,
    pub streaming_agent: Option<AgentTag>,

    pub task_stats: TaskStats,
    pub lifetime_stats: LifetimeStats,

    pub pending_approval: Option<PendingToolApproval>,

    pub inflight_request: Option<RequestTiming>,
    pub retry: Option<LlmRetryState>,
    pub last_heartbeat_at: Option<u64>,

    pub queue: QueueSnapshot,

    pub is_compacting: bool,
    pub pending_compaction: bool,
}

impl CoordinatorState {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            sessions: vec![AgentSession::new()],
            current_index: 0,
            status: AgentStatus::Idle,
            error: None,
            streaming_content: String::new(),
            streaming_reasoning: String::new(),
            streaming_reasoning_status: ReasoningStatus::Idle,
            streaming_agent: None,
            task_stats: TaskStats::default(),
            lifetime_stats: LifetimeStats::default(),
            pending_approval: None,
            inflight_request: None,
            retry: None,
            last_heartbeat_at: None,
            queue: QueueSnapshot::default(),
            is_compacting: false,
            pending_compaction: false,
        }
    }

    pub fn current_session(&self) -> &AgentSession {
        &self.sessions[self.current_index]
    }

    pub fn current_session_mut(&mut self) -> &mut AgentSession {
        &mut self.sessions[self.current_index]
    }

    pub fn current_session_id(&self) -> SessionId {
        self.current_session().id
    }

    pub fn session_index(&self, id: SessionId) -> Option<usize> {
        self.sessions.iter().position(|s| s.id == id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut AgentSession> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    pub fn reset_streaming(&mut self) {
        self.streaming_content.clear();
        self.streaming_reasoning.clear();
        self.streaming_reasoning_status = ReasoningStatus::Idle;
        self.streaming_agent = None;
    }

    pub fn clear_request_tracking(&mut self) {
        self.inflight_request = None;
        self.retry = None;
    }

    /// Full transient reset at a session-switch boundary or a fresh task.
    pub fn reset_task_state(&mut self) {
        self.task_stats = TaskStats::default();
        self.reset_streaming();
        self.pending_approval = None;
        self.clear_request_tracking();
        self.error = None;
    }

    /// Healthy until a first heartbeat is seen, then while heartbeats stay
    /// fresh. Observer-only.
    pub fn connection_healthy(&self, now_ms: u64) -> bool {
        match self.last_heartbeat_at {
            None => true,
            Some(last) => now_ms.saturating_sub(last) < HEARTBEAT_STALE_MS,
        }
    }

    pub fn to_durable(&self) -> DurableState {
        DurableState {
            sessions: self.sessions.clone(),
            current_session_id: self.current_session_id(),
            lifetime_stats: self.lifetime_stats,
        }
    }

    /// Rebuilds live state from the durable record; transient fields come
    /// back empty/idle.
    pub fn hydrate(config: AgentConfig, record: DurableState) -> Self {
        let mut state = Self::new(config);
        if !record.sessions.is_empty() {
            state.current_index = record
                .sessions
                .iter()
                .position(|s| s.id == record.current_session_id)
                .unwrap_or(0);
            state.sessions = record.sessions;
        }
        state.lifetime_stats = record.lifetime_stats;
        state
    }
}

/// The only shape that reaches disk; everything else resets on reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableState {
    pub sessions: Vec<AgentSession>,
    pub current_session_id: SessionId,
    pub lifetime_stats: LifetimeStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> CoordinatorState {
        CoordinatorState::new(AgentConfig::default())
    }

    #[test]
    fn test_new_state_has_one_empty_session() {
        let state = test_state();
        assert_eq!(state.sessions.len(), 1);
        assert!(state.current_session().messages.is_empty());
        assert_eq!(state.status, AgentStatus::Idle);
    }

    #[test]
    fn test_hydrate_resets_transients() {
        let mut state = test_state();
        state.streaming_content = "partial".to_string();
        state.status = AgentStatus::Running;
        state.task_stats.tool_calls = 4;
        state.lifetime_stats.tool_calls = 9;

        let record = state.to_durable();
        let restored = CoordinatorState::hydrate(AgentConfig::default(), record);

        assert!(restored.streaming_content.is_empty());
        assert_eq!(restored.status, AgentStatus::Idle);
        assert_eq!(restored.task_stats, TaskStats::default());
        assert_eq!(restored.lifetime_stats.tool_calls, 9);
    }

    #[test]
    fn test_hydrate_restores_active_session_pointer() {
        let mut state = test_state();
        state.sessions.push(AgentSession::new());
        state.current_index = 1;

        let record = state.to_durable();
        let restored = CoordinatorState::hydrate(AgentConfig::default(), record);
        assert_eq!(restored.current_session_id(), state.sessions[1].id);
    }

    #[test]
    fn test_connection_health_window() {
        let mut state = test_state();
        assert!(state.connection_healthy(1_000_000));

        state.last_heartbeat_at = Some(1_000_000);
        assert!(state.connection_healthy(1_000_000 + HEARTBEAT_STALE_MS - 1));
        assert!(!state.connection_healthy(1_000_000 + HEARTBEAT_STALE_MS));
    }
}
