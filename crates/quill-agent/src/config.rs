use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Active model configuration for the coordinator. Mirrors what the
/// execution engine is launched with; the coordinator itself only consults
/// the model name (context window) and the thinking-stream capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub provider: String,
    pub model: String,
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub auto_approve: bool,
    /// Whether the model streams reasoning before its answer.
    #[serde(default)]
    pub thinking_stream: bool,
    /// Explicit context-window override; otherwise resolved from the model name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> usize {
    4096
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: String::new(),
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            auto_approve: false,
            thinking_stream: false,
            context_window: None,
        }
    }
}

impl AgentConfig {
    /// Rejects configurations a task can never start with.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "missing API key for provider {}",
                self.provider
            )));
        }
        Ok(())
    }

    pub fn resolved_context_window(&self) -> u32 {
        self.context_window
            .unwrap_or_else(|| context_window_for(&self.model))
    }
}

const DEFAULT_CONTEXT_WINDOW: u32 = 128_000;

/// Prefix-matched context windows for known model families. First match wins.
static CONTEXT_WINDOWS: Lazy<Vec<(&'static str, u32)>> = Lazy::new(|| {
    vec![
        ("claude", 200_000),
        ("gemini", 1_000_000),
        ("gpt-4o", 128_000),
        ("gpt-4.1", 128_000),
        ("deepseek", 64_000),
    ]
});

pub fn context_window_for(model: &str) -> u32 {
    let model = model.to_ascii_lowercase();
    CONTEXT_WINDOWS
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map_or(DEFAULT_CONTEXT_WINDOW, |(_, window)| *window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("claude-sonnet-4-5", 200_000)]
    #[case("gpt-4o-mini", 128_000)]
    #[case("deepseek-chat", 64_000)]
    #[case("gemini-2.5-pro", 1_000_000)]
    #[case("some-unknown-model", 128_000)]
    fn test_context_window_resolution(#[case] model: &str, #[case] expected: u32) {
        assert_eq!(context_window_for(model), expected);
    }

    #[test]
    fn test_override_beats_catalog() {
        let config = AgentConfig {
            model: "claude-sonnet-4-5".to_string(),
            context_window: Some(100_000),
            ..Default::default()
        };
        assert_eq!(config.resolved_context_window(), 100_000);
    }

    #[test]
    fn test_validate_rejects_missing_api_key() {
        let config = AgentConfig::default();
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(_))
        ));

        let config = AgentConfig {
            api_key: "sk-test".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
