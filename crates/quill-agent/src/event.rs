//! Inbound event vocabulary.
//!
//! Events arrive from the execution engine over an external transport,
//! discriminated by `type` with a `data` payload. The two `Compaction*`
//! variants are synthetic: only the coordinator injects them, feeding the
//! result of an async summarization back through the same channel so the
//! commit race check is an ordinary reducer case.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::session::{AgentTag, Message};
use crate::types::SessionId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTaskSummary {
    pub id: String,
    pub task: String,
    pub workspace_path: String,
    pub enqueued_at: u64,
    pub position: usize,
}

/// Engine-side task queue, mirrored for display. The coordinator never
/// mutates it; `queue_updated` events replace it wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_task: Option<String>,
    #[serde(default)]
    pub queued: Vec<QueuedTaskSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted,
    RunPaused,
    RunResumed,
    RunCompleted,
    RunFailed {
        error: String,
    },
    RunAborted,
    TextDelta {
        delta: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    ReasoningDelta {
        content: String,
    },
    ReasoningDone,
    TextFinal {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    ToolStart {
        tool: ToolCallInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    ToolResult {
        tool: String,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    ToolError {
        tool: String,
        error: String,
    },
    PermissionAsked {
        permission: String,
        #[serde(default)]
        metadata: Value,
    },
    PermissionReplied,
    QueueUpdated {
        running: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_task: Option<String>,
        #[serde(default)]
        queued: Vec<QueuedTaskSummary>,
    },
    StepFinish {
        tokens: TokenUsage,
    },
    MessageChunk {
        content: String,
        agent: AgentTag,
    },
    Complete {
        result: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    LlmRequestStart {
        request_id: String,
        timestamp: u64,
    },
    LlmRequestEnd,
    LlmRetryScheduled {
        request_id: String,
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
        reason: String,
        next_retry_at: u64,
    },
    Heartbeat {
        timestamp: u64,
    },
    CompactionReady {
        session_id: SessionId,
        base_len: usize,
        summary: String,
        tail: Vec<Message>,
    },
    CompactionFailed {
        session_id: SessionId,
        error: String,
    },
}

impl EngineEvent {
    /// Target session, for events that can address a session other than the
    /// one currently on screen.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            EngineEvent::TextDelta { session_id, .. }
            | EngineEvent::TextFinal { session_id, .. }
            | EngineEvent::ToolStart { session_id, .. }
            | EngineEvent::ToolResult { session_id, .. }
            | EngineEvent::Complete { session_id, .. }
            | EngineEvent::Error { session_id, .. } => *session_id,
            _ => None,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(
            self,
            EngineEvent::CompactionReady { .. } | EngineEvent::CompactionFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape_uses_type_and_data() {
        let event = EngineEvent::TextDelta {
            delta: "Hi".to_string(),
            session_id: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "text_delta");
        assert_eq!(json["data"]["delta"], "Hi");
    }

    #[test]
    fn test_unit_variants_deserialize_without_data() {
        let event: EngineEvent = serde_json::from_str(r#"{"type":"run_started"}"#).unwrap();
        assert!(matches!(event, EngineEvent::RunStarted));
    }

    #[test]
    fn test_session_id_only_on_background_capable_events() {
        let sid = SessionId::new();
        let event = EngineEvent::Complete {
            result: "done".to_string(),
            session_id: Some(sid),
        };
        assert_eq!(event.session_id(), Some(sid));
        assert_eq!(EngineEvent::RunCompleted.session_id(), None);
    }

    #[test]
    fn test_retry_scheduled_roundtrip() {
        let json = r#"{
            "type": "llm_retry_scheduled",
            "data": {
                "request_id": "req-1",
                "attempt": 2,
                "max_retries": 5,
                "delay_ms": 1500,
                "reason": "overloaded",
                "next_retry_at": 1700000000000
            }
        }"#;
        let event: EngineEvent = serde_json::from_str(json).unwrap();
        match event {
            EngineEvent::LlmRetryScheduled {
                attempt, delay_ms, ..
            } => {
                assert_eq!(attempt, 2);
                assert_eq!(delay_ms, 1500);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
