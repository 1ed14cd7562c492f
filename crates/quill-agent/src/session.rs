use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SessionId;

/// Reserved id of the synthetic message that stands for "everything before
/// here has been summarized". At most one per session, always the oldest
/// message after a compaction.
pub const SUMMARY_MESSAGE_ID: &str = "__conversation_summary__";

/// Marker prepended to sentinel content so renderers can recognize it.
pub const SUMMARY_MARKER: &str = "[Conversation summary]";

pub const DEFAULT_SESSION_TITLE: &str = "New session";

const TITLE_MAX_CHARS: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Which cooperating sub-agent authored a streamed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentTag {
    Coordinator,
    Planner,
    Executor,
    Editor,
    Researcher,
    Writer,
    Organizer,
    Reporter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// What was actually typed, when it differs from the display content
    /// (e.g. inlined file bodies are omitted from `content`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_tag: Option<AgentTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            raw_content: None,
            attachments: Vec::new(),
            agent_tag: None,
            id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn summary(text: impl AsRef<str>) -> Self {
        let mut message = Self::system(format!("{SUMMARY_MARKER}\n{}", text.as_ref()));
        message.id = Some(SUMMARY_MESSAGE_ID.to_string());
        message
    }

    pub fn with_agent(mut self, agent: AgentTag) -> Self {
        self.agent_tag = Some(agent);
        self
    }

    pub fn is_summary(&self) -> bool {
        self.id.as_deref() == Some(SUMMARY_MESSAGE_ID)
    }
}

/// A user task submission. `text` is the display form; `raw_text` preserves
/// the typed input when the two differ.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInput {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl TaskInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            raw_text: None,
            attachments: Vec::new(),
        }
    }
}

/// Message id used for the in-progress streaming placeholder of a background
/// session (one not currently on screen).
pub fn streaming_placeholder_id(session_id: SessionId) -> String {
    format!("stream-{session_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: SessionId,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_tokens_used: u64,
}

impl AgentSession {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            title: DEFAULT_SESSION_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            total_tokens_used: 0,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    /// Replaces the default title with the first real user content.
    pub fn adopt_title(&mut self, text: &str) {
        if self.title != DEFAULT_SESSION_TITLE {
            return;
        }
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        self.title = if trimmed.chars().count() <= TITLE_MAX_CHARS {
            trimmed.to_string()
        } else {
            let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS - 1).collect();
            title.push('…');
            title
        };
    }
}

impl Default for AgentSession {
    fn default() -> Self {
        Self::new()
    }
}
