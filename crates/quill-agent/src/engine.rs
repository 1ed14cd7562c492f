//! Seams to the external collaborators: the execution engine that runs
//! tasks, the single-round-trip summarizer used by compaction, and the
//! best-effort session mirror for a companion surface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::event::QueueSnapshot;
use crate::session::{Message, TaskInput};
use crate::state::DurableState;
use crate::types::RequestId;

/// Task context handed to the engine alongside the task text. `history`
/// carries prior turns filtered to user/assistant roles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    pub workspace_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_note_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_note_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_tree: Option<String>,
    #[serde(default)]
    pub history: Vec<Message>,
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn start_task(
        &self,
        config: &AgentConfig,
        task: &TaskInput,
        context: &TaskContext,
    ) -> Result<()>;

    async fn abort(&self) -> Result<()>;

    async fn approve_or_reject_tool(&self, request_id: &RequestId, approved: bool) -> Result<()>;

    async fn enable_debug(&self, workspace_path: &str) -> Result<String>;

    async fn disable_debug(&self) -> Result<()>;

    async fn queue_status(&self) -> Result<QueueSnapshot>;
}

/// One bounded LLM round-trip producing a conversation summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str, temperature: f32, max_tokens: usize) -> Result<String>;
}

/// Mirrors session metadata to a secondary surface (e.g. a companion
/// device). Failures are logged and swallowed by the caller.
#[async_trait]
pub trait SessionSync: Send + Sync {
    async fn sync(&self, record: &DurableState) -> Result<()>;
}

/// Engine that accepts everything and does nothing. Useful for wiring up
/// the coordinator in tests and headless tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEngine;

#[async_trait]
impl ExecutionEngine for NullEngine {
    async fn start_task(
        &self,
        _config: &AgentConfig,
        _task: &TaskInput,
        _context: &TaskContext,
    ) -> Result<()> {
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        Ok(())
    }

    async fn approve_or_reject_tool(&self, _request_id: &RequestId, _approved: bool) -> Result<()> {
        Ok(())
    }

    async fn enable_debug(&self, _workspace_path: &str) -> Result<String> {
        Err(Error::Engine("debug logging not supported".to_string()))
    }

    async fn disable_debug(&self) -> Result<()> {
        Ok(())
    }

    async fn queue_status(&self) -> Result<QueueSnapshot> {
        Ok(QueueSnapshot::default())
    }
}

/// Summarizer stand-in for setups without a model; compaction stays
/// pending and retries silently, which is the specified failure mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSummarizer;

#[async_trait]
impl Summarizer for NullSummarizer {
    async fn summarize(
        &self,
        _prompt: &str,
        _temperature: f32,
        _max_tokens: usize,
    ) -> Result<String> {
        Err(Error::Summarizer("no summarizer configured".to_string()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSync;

#[async_trait]
impl SessionSync for NullSync {
    async fn sync(&self, _record: &DurableState) -> Result<()> {
        Ok(())
    }
}
