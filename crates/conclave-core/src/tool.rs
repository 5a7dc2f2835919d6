use crate::error::{ConclaveError, ConclaveResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A request from an agent to invoke a specific tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned by the backend for this tool call.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// JSON arguments to pass to the tool.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// The result returned after executing a [`ToolCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The ID of the [`ToolCall`] this result corresponds to.
    pub call_id: String,
    /// The textual output produced by the tool.
    pub content: String,
    /// Whether the tool execution ended in an error.
    pub is_error: bool,
}

impl ToolResult {
    /// Creates a successful tool result.
    pub fn success(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// Creates an error tool result.
    pub fn error(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// Metadata describing a tool's interface, sent to the completion backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    /// Registry key and the name the backend uses in tool calls.
    pub name: String,
    /// Human-readable description shown to the model.
    pub description: String,
    /// JSON schema of the accepted arguments.
    pub parameters_schema: serde_json::Value,
}

/// Trait every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Static description of the tool.
    fn descriptor(&self) -> &ToolDescriptor;

    /// The tool's registry name.
    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Invoke the tool.
    async fn call(&self, call: &ToolCall) -> ConclaveResult<ToolResult>;
}

/// Central registry for all available tools.
///
/// Tools are looked up by name once, when an agent is spawned or a job is
/// added; hot paths hold the resolved `Arc<dyn Tool>` handles.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        info!(tool = %name, "Registered tool");
        self.tools.insert(name, tool);
    }

    /// Look up a single tool.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Resolve a list of tool names into handles, failing on the first unknown name.
    pub fn resolve(&self, names: &[String]) -> ConclaveResult<Vec<Arc<dyn Tool>>> {
        names
            .iter()
            .map(|name| {
                self.tools
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ConclaveError::Config(format!("Unknown tool: {name}")))
            })
            .collect()
    }

    /// Descriptors of every registered tool, sorted by name.
    pub fn list_descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut descriptors: Vec<&ToolDescriptor> =
            self.tools.values().map(|t| t.descriptor()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Number of registered tools.
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Execute a tool call against an already-resolved tool set.
///
/// Unknown names and tool errors become error [`ToolResult`]s so that one bad
/// call never aborts the dispatch that produced it.
pub async fn execute_call(tools: &[Arc<dyn Tool>], call: &ToolCall) -> ToolResult {
    match tools.iter().find(|t| t.name() == call.name) {
        Some(tool) => match tool.call(call).await {
            Ok(result) => result,
            Err(e) => ToolResult::error(&call.id, e.to_string()),
        },
        None => ToolResult::error(
            &call.id,
            format!("Tool '{}' is not available to this agent", call.name),
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct UpperTool {
        descriptor: ToolDescriptor,
    }

    impl UpperTool {
        fn new() -> Self {
            Self {
                descriptor: ToolDescriptor {
                    name: "upper".into(),
                    description: "Uppercases the `text` argument".into(),
                    parameters_schema: serde_json::json!({"type": "object"}),
                },
            }
        }
    }

    #[async_trait]
    impl Tool for UpperTool {
        fn descriptor(&self) -> &ToolDescriptor {
            &self.descriptor
        }

        async fn call(&self, call: &ToolCall) -> ConclaveResult<ToolResult> {
            let text = call.arguments["text"]
                .as_str()
                .ok_or_else(|| ConclaveError::Tool("missing text".into()))?;
            Ok(ToolResult::success(&call.id, text.to_uppercase()))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(UpperTool::new()));
        registry
    }

    #[test]
    fn test_resolve_known_and_unknown() {
        let registry = registry();
        let resolved = registry.resolve(&["upper".to_string()]).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name(), "upper");

        let err = registry
            .resolve(&["upper".to_string(), "shell".to_string()])
            .err()
            .unwrap();
        assert!(matches!(err, ConclaveError::Config(_)));
        assert!(err.to_string().contains("shell"));
    }

    #[tokio::test]
    async fn test_execute_call_success_and_errors() {
        let tools = registry().resolve(&["upper".to_string()]).unwrap();

        let ok = ToolCall {
            id: "c1".into(),
            name: "upper".into(),
            arguments: serde_json::json!({"text": "quiet"}),
        };
        let result = execute_call(&tools, &ok).await;
        assert!(!result.is_error);
        assert_eq!(result.content, "QUIET");

        let bad_args = ToolCall {
            id: "c2".into(),
            name: "upper".into(),
            arguments: serde_json::json!({}),
        };
        assert!(execute_call(&tools, &bad_args).await.is_error);

        let missing = ToolCall {
            id: "c3".into(),
            name: "shell".into(),
            arguments: serde_json::Value::Null,
        };
        let result = execute_call(&tools, &missing).await;
        assert!(result.is_error);
        assert!(result.content.contains("not available"));
    }

    #[test]
    fn test_list_descriptors_sorted() {
        let registry = registry();
        let names: Vec<_> = registry
            .list_descriptors()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(names, vec!["upper".to_string()]);
        assert_eq!(registry.tool_count(), 1);
    }
}
