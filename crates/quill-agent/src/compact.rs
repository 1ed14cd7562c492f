//! Context compaction: when the conversation risks exceeding the model's
//! context window, older messages are replaced by a generated summary.
//!
//! The reducer only *plans* a compaction (a pure snapshot of what to
//! summarize); the coordinator performs the LLM round-trip and feeds the
//! result back as a `compaction_ready` event, where `apply_summary` runs
//! the race check before committing.

use crate::estimate::estimate_conversation_tokens;
use crate::session::{AgentSession, Message};
use crate::types::SessionId;

/// Trigger when estimated tokens reach this share of the context window.
pub const AUTO_COMPACT_RATIO: f64 = 0.95;

/// Most-recent messages that always survive a compaction.
pub const COMPACT_KEEP_RECENT: usize = 6;

/// Per-message cap when serializing history into the summary prompt.
pub const MAX_CHARS_PER_MESSAGE: usize = 2_000;

/// Global cap on the serialized summary prompt.
pub const MAX_PROMPT_CHARS: usize = 24_000;

pub const SUMMARY_TEMPERATURE: f32 = 0.3;
pub const SUMMARY_MAX_TOKENS: usize = 1_024;

pub fn should_auto_compact(total_tokens: u64, context_window: u32) -> bool {
    context_window > 0 && total_tokens as f64 / f64::from(context_window) >= AUTO_COMPACT_RATIO
}

pub fn over_budget(session: &AgentSession, context_window: u32) -> bool {
    should_auto_compact(
        estimate_conversation_tokens(&session.messages),
        context_window,
    )
}

/// Everything the async summarization needs, snapshotted before it starts.
/// `base_len` is the message count at snapshot time.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    pub session_id: SessionId,
    pub base_len: usize,
    pub tail: Vec<Message>,
    pub prompt: String,
}

/// Builds a compaction plan, or `None` when there is nothing to compact
/// (at most `COMPACT_KEEP_RECENT` messages besides the sentinel).
pub fn plan_compaction(session: &AgentSession) -> Option<CompactionPlan> {
    let prior_summary = session
        .messages
        .iter()
        .find(|m| m.is_summary())
        .map(|m| m.content.clone());
    let working: Vec<&Message> = session.messages.iter().filter(|m| !m.is_summary()).collect();

    if working.len() <= COMPACT_KEEP_RECENT {
        return None;
    }

    let split = working.len() - COMPACT_KEEP_RECENT;
    let (to_summarize, tail) = working.split_at(split);

    Some(CompactionPlan {
        session_id: session.id,
        base_len: session.messages.len(),
        tail: tail.iter().map(|m| (*m).clone()).collect(),
        prompt: build_summary_prompt(prior_summary.as_deref(), to_summarize),
    })
}

/// Serializes the to-summarize window. Each entry is char-capped, then whole
/// entries are dropped from the oldest end until the prompt fits the global
/// cap. A prior sentinel's content leads the prompt so repeated compactions
/// lose nothing.
fn build_summary_prompt(prior_summary: Option<&str>, messages: &[&Message]) -> String {
    let mut entries: Vec<String> = Vec::with_capacity(messages.len() + 1);
    if let Some(prior) = prior_summary {
        entries.push(truncate_chars(prior, MAX_CHARS_PER_MESSAGE));
    }
    for message in messages {
        entries.push(format!(
            "{}: {}",
            message.role,
            truncate_chars(&message.content, MAX_CHARS_PER_MESSAGE)
        ));
    }

    let mut total: usize = entries.iter().map(|e| e.len() + 1).sum();
    let mut start = 0;
    while total > MAX_PROMPT_CHARS && start + 1 < entries.len() {
        total -= entries[start].len() + 1;
        start += 1;
    }

    entries[start..].join("\n")
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Outcome of attempting to commit a finished summarization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// Committed; `newer_arrived` means messages landed during summarization
    /// and were spliced in after the rebuilt tail.
    Committed { newer_arrived: bool },
    /// The session shrank below the snapshot: a concurrent reset happened.
    /// Nothing was committed.
    ConcurrentReset,
}

/// Race-checked commit against the live session. Messages appended since the
/// snapshot are preserved after `[sentinel, ...tail]`.
pub fn apply_summary(
    session: &mut AgentSession,
    base_len: usize,
    summary: String,
    tail: Vec<Message>,
) -> CompactionOutcome {
    if session.messages.len() < base_len {
        return CompactionOutcome::ConcurrentReset;
    }

    let newer: Vec<Message> = session.messages[base_len..].to_vec();
    let newer_arrived = !newer.is_empty();

    let mut rebuilt = Vec::with_capacity(1 + tail.len() + newer.len());
    rebuilt.push(Message::summary(summary));
    rebuilt.extend(tail);
    rebuilt.extend(newer);

    session.messages = rebuilt;
    session.touch();

    CompactionOutcome::Committed { newer_arrived }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Role, SUMMARY_MARKER};

    fn session_with(count: usize) -> AgentSession {
        let mut session = AgentSession::new();
        for i in 0..count {
            let message = if i % 2 == 0 {
                Message::user(format!("question {i}"))
            } else {
                Message::assistant(format!("answer {i}"))
            };
            session.messages.push(message);
        }
        session
    }

    #[test]
    fn test_no_plan_at_or_under_tail_size() {
        assert!(plan_compaction(&session_with(COMPACT_KEEP_RECENT)).is_none());
        assert!(plan_compaction(&session_with(3)).is_none());
    }

    #[test]
    fn test_plan_splits_tail_from_older_messages() {
        let session = session_with(10);
        let plan = plan_compaction(&session).unwrap();

        assert_eq!(plan.tail.len(), COMPACT_KEEP_RECENT);
        assert_eq!(plan.base_len, 10);
        assert_eq!(plan.tail[0].content, "question 4");
        // Oldest messages feed the prompt.
        assert!(plan.prompt.contains("question 0"));
        assert!(!plan.prompt.contains("question 4"));
    }

    #[test]
    fn test_prior_sentinel_content_carries_into_prompt() {
        let mut session = session_with(10);
        session
            .messages
            .insert(0, Message::summary("we renamed chapter one"));
        let plan = plan_compaction(&session).unwrap();
        assert!(plan.prompt.contains("we renamed chapter one"));
        // The sentinel never counts toward the working set.
        assert_eq!(plan.tail.len(), COMPACT_KEEP_RECENT);
    }

    #[test]
    fn test_prompt_trims_oldest_entries_first() {
        let mut session = AgentSession::new();
        for i in 0..40 {
            session
                .messages
                .push(Message::user(format!("{i:03} {}", "x".repeat(1_500))));
        }
        let plan = plan_compaction(&session).unwrap();
        assert!(plan.prompt.len() <= MAX_PROMPT_CHARS);
        // The newest summarized entry survives; the oldest does not.
        assert!(plan.prompt.contains("033"));
        assert!(!plan.prompt.contains("000"));
    }

    #[test]
    fn test_apply_summary_rebuilds_sentinel_plus_tail() {
        let mut session = session_with(10);
        let plan = plan_compaction(&session).unwrap();
        let outcome = apply_summary(&mut session, plan.base_len, "the gist".to_string(), plan.tail);

        assert_eq!(outcome, CompactionOutcome::Committed { newer_arrived: false });
        assert_eq!(session.messages.len(), 1 + COMPACT_KEEP_RECENT);
        assert!(session.messages[0].is_summary());
        assert!(session.messages[0].content.contains(SUMMARY_MARKER));
        assert_eq!(session.messages.last().unwrap().content, "answer 9");
    }

    #[test]
    fn test_apply_summary_splices_newer_messages() {
        let mut session = session_with(10);
        let plan = plan_compaction(&session).unwrap();
        session.messages.push(Message::user("arrived mid-flight"));

        let outcome = apply_summary(&mut session, plan.base_len, "gist".to_string(), plan.tail);
        assert_eq!(outcome, CompactionOutcome::Committed { newer_arrived: true });
        assert_eq!(session.messages.last().unwrap().content, "arrived mid-flight");
        assert_eq!(session.messages.len(), 1 + COMPACT_KEEP_RECENT + 1);
    }

    #[test]
    fn test_apply_summary_detects_concurrent_reset() {
        let mut session = session_with(10);
        let plan = plan_compaction(&session).unwrap();
        session.messages.truncate(2);

        let before = session.messages.clone();
        let outcome = apply_summary(&mut session, plan.base_len, "gist".to_string(), plan.tail);
        assert_eq!(outcome, CompactionOutcome::ConcurrentReset);
        assert_eq!(session.messages, before);
    }

    #[test]
    fn test_second_compaction_without_new_messages_is_noop() {
        let mut session = session_with(10);
        let plan = plan_compaction(&session).unwrap();
        apply_summary(&mut session, plan.base_len, "gist".to_string(), plan.tail);

        assert!(plan_compaction(&session).is_none());
    }

    #[test]
    fn test_should_auto_compact_threshold() {
        assert!(!should_auto_compact(94_999, 100_000));
        assert!(should_auto_compact(95_000, 100_000));
        assert!(should_auto_compact(400_000, 100_000));
        assert!(!should_auto_compact(1, 0));
    }

    #[test]
    fn test_message_preview_truncation() {
        let long = "y".repeat(MAX_CHARS_PER_MESSAGE + 50);
        let capped = truncate_chars(&long, MAX_CHARS_PER_MESSAGE);
        assert_eq!(capped.chars().count(), MAX_CHARS_PER_MESSAGE);
        assert!(capped.ends_with('…'));
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn test_role_labels_appear_in_prompt() {
        let session = session_with(8);
        let plan = plan_compaction(&session).unwrap();
        assert!(plan.prompt.contains(&format!("{}: question 0", Role::User)));
    }
}
