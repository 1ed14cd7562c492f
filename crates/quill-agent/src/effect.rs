use crate::compact::CompactionPlan;
use crate::engine::TaskContext;
use crate::session::TaskInput;
use crate::state::AgentStatus;
use crate::types::{RequestId, SessionId};

/// Side-effect intents emitted by the reducer. The reducer never performs
/// them; the coordinator interprets each one after the state transition has
/// already been applied.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Forward a task to the execution engine.
    SendTask {
        task: TaskInput,
        context: TaskContext,
    },

    /// Ask the engine to abort the current run.
    AbortRun,

    /// Answer an outstanding permission request.
    ReplyPermission {
        request_id: RequestId,
        approved: bool,
    },

    /// Start an async summarization; its result re-enters the event channel
    /// as `compaction_ready` / `compaction_failed`.
    RequestCompaction { plan: CompactionPlan },

    /// Save the durable record through the session store.
    PersistSessions,

    /// Best-effort mirror of session metadata to a companion surface.
    SyncSessions,

    Notify(Notification),
}

/// Coarse change notifications for subscribers (a UI or remote mirror).
/// Deltas are deliberately not notified per-chunk; subscribers poll the
/// streaming buffers off the state snapshot instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    StatusChanged(AgentStatus),
    MessageAppended(SessionId),
    SessionListChanged,
    ApprovalRequested(RequestId),
    QueueChanged,
}

impl Effect {
    pub fn is_notify(&self) -> bool {
        matches!(self, Effect::Notify(_))
    }

    pub fn into_notification(self) -> Option<Notification> {
        match self {
            Effect::Notify(notification) => Some(notification),
            _ => None,
        }
    }
}
