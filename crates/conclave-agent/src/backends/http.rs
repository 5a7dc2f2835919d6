use crate::backend::{Completion, CompletionBackend, CompletionRequest};
use async_trait::async_trait;
use conclave_core::{ConclaveError, ConclaveResult, Role, ToolDescriptor};
use serde::Serialize;
use tracing::debug;

/// Wire shape of a completion request.
#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    agent: Option<&'a str>,
    system_prompt: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
    tools: &'a [ToolDescriptor],
    model: &'a serde_json::Value,
    timeout_ms: u64,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a str,
}

/// Completion backend reached over HTTP.
///
/// POSTs `{agent, system_prompt, messages, tools, model, timeout_ms}` to the configured
/// URL and expects `{text, tool_calls}` back. Retries and circuit breaking are
/// layered on top by [`crate::ResilientBackend`].
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    /// Create a backend for the given endpoint.
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    async fn complete(&self, request: CompletionRequest) -> ConclaveResult<Completion> {
        let body = WireRequest {
            agent: request.agent_id.as_deref(),
            system_prompt: request.system_prompt.as_deref(),
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
            tools: &request.tools,
            model: &request.model_config,
            timeout_ms: u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX),
        };

        let mut builder = self
            .client
            .post(&self.url)
            .timeout(request.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(url = %self.url, messages = body.messages.len(), "Sending completion request");

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ConclaveError::Timeout(format!("completion request timed out: {e}"))
            } else {
                ConclaveError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ConclaveError::Backend(format!("HTTP {status}: {text}")));
        }

        response.json::<Completion>().await.map_err(|e| {
            if e.is_timeout() {
                ConclaveError::Timeout(format!("completion body timed out: {e}"))
            } else {
                ConclaveError::Agent(format!("Malformed completion response: {e}"))
            }
        })
    }
}
