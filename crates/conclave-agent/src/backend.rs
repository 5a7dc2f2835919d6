use async_trait::async_trait;
use conclave_core::{ConclaveResult, Message, ToolCall, ToolDescriptor};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything the backend needs for one completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Id of the agent this completion is for, when known.
    pub agent_id: Option<String>,
    /// Agent persona / instructions.
    pub system_prompt: Option<String>,
    /// Conversation so far, oldest first.
    pub messages: Vec<Message>,
    /// Tools the agent may call during this completion.
    pub tools: Vec<ToolDescriptor>,
    /// Opaque per-agent model configuration, forwarded untouched.
    pub model_config: serde_json::Value,
    /// Hard deadline the backend should honour.
    pub timeout: Duration,
}

impl CompletionRequest {
    /// A single-message request with no tools and an empty model config.
    pub fn prompt(prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            agent_id: None,
            system_prompt: None,
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
            model_config: serde_json::Value::Null,
            timeout,
        }
    }

    /// Content of the last message, which is the prompt for this turn.
    pub fn last_content(&self) -> &str {
        self.messages.last().map(|m| m.content.as_str()).unwrap_or("")
    }
}

/// What the backend produced: text and any tool calls it requested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// The agent's textual answer.
    #[serde(default)]
    pub text: String,
    /// Tool invocations the agent asked for.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl Completion {
    /// A plain-text completion with no tool calls.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// Trait for completion backends.
///
/// Implementations are expected to enforce `request.timeout` themselves and to
/// surface deadline expiry as [`conclave_core::ConclaveError::Timeout`].
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Run one completion.
    async fn complete(&self, request: CompletionRequest) -> ConclaveResult<Completion>;
}
