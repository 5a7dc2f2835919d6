#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use conclave_core::*;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// A tool that always fails, used to check error containment
// ---------------------------------------------------------------------------

struct FailingTool {
    descriptor: ToolDescriptor,
}

#[async_trait]
impl Tool for FailingTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, _call: &ToolCall) -> ConclaveResult<ToolResult> {
        Err(ConclaveError::Tool("disk on fire".into()))
    }
}

#[tokio::test]
async fn tool_errors_become_error_results() {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(FailingTool {
        descriptor: ToolDescriptor {
            name: "fail".into(),
            description: "always fails".into(),
            parameters_schema: serde_json::json!({}),
        },
    }));

    let tools = registry.resolve(&["fail".to_string()]).unwrap();
    let call = ToolCall {
        id: "call_1".into(),
        name: "fail".into(),
        arguments: serde_json::json!({}),
    };
    let result = execute_call(&tools, &call).await;

    assert!(result.is_error);
    assert_eq!(result.call_id, "call_1");
    assert!(result.content.contains("disk on fire"));
}

#[test]
fn tool_call_deserializes_without_arguments() {
    let call: ToolCall = serde_json::from_str(r#"{"id":"c","name":"clock"}"#).unwrap();
    assert_eq!(call.name, "clock");
    assert!(call.arguments.is_null());
}

#[test]
fn message_roundtrip_keeps_metadata() {
    let mut msg = Message::system("You are terse.");
    msg.metadata
        .insert("phase".into(), serde_json::Value::String("EXPLORE".into()));

    let json = serde_json::to_string(&msg).unwrap();
    let back: Message = serde_json::from_str(&json).unwrap();

    assert_eq!(back.id, msg.id);
    assert_eq!(back.role, Role::System);
    assert_eq!(back.metadata["phase"], "EXPLORE");
}
