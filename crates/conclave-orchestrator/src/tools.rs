//! Built-in tools available to every deployment.

use crate::pheromone::PheromoneConfig;
use crate::registry::AgentRegistry;
use crate::router::effective_pheromone;
use async_trait::async_trait;
use chrono::Utc;
use conclave_core::{ConclaveResult, Tool, ToolCall, ToolDescriptor, ToolRegistry, ToolResult};
use std::sync::Arc;

/// Reports the current UTC time.
pub struct ClockTool {
    descriptor: ToolDescriptor,
}

impl ClockTool {
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "clock".to_string(),
                description: "Current UTC time. Use format 'rfc3339' (default) or 'unix'."
                    .to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "format": {
                            "type": "string",
                            "enum": ["rfc3339", "unix"]
                        }
                    }
                }),
            },
        }
    }
}

impl Default for ClockTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ClockTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, call: &ToolCall) -> ConclaveResult<ToolResult> {
        let now = Utc::now();
        match call.arguments["format"].as_str().unwrap_or("rfc3339") {
            "rfc3339" => Ok(ToolResult::success(&call.id, now.to_rfc3339())),
            "unix" => Ok(ToolResult::success(&call.id, now.timestamp().to_string())),
            other => Ok(ToolResult::error(
                &call.id,
                format!("Unknown format '{other}'. Use 'rfc3339' or 'unix'"),
            )),
        }
    }
}

/// Lists registered agents with their specialties, status and reputation.
pub struct AgentRosterTool {
    descriptor: ToolDescriptor,
    registry: Arc<AgentRegistry>,
    pheromone: PheromoneConfig,
}

impl AgentRosterTool {
    pub fn new(registry: Arc<AgentRegistry>, pheromone: PheromoneConfig) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "agent_roster".to_string(),
                description: "List the agents in this deployment with their specialty domains, \
                    status and pheromone score. Pass 'domain' to keep only agents with that tag."
                    .to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "domain": {
                            "type": "string",
                            "description": "Optional specialty tag filter"
                        }
                    }
                }),
            },
            registry,
            pheromone,
        }
    }
}

#[async_trait]
impl Tool for AgentRosterTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, call: &ToolCall) -> ConclaveResult<ToolResult> {
        let domain = call.arguments["domain"]
            .as_str()
            .map(|d| d.trim().to_lowercase());
        let now = Utc::now();
        let agents: Vec<serde_json::Value> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|a| {
                domain
                    .as_ref()
                    .map_or(true, |d| a.specialty_domains.contains(d))
            })
            .map(|a| {
                serde_json::json!({
                    "id": a.id,
                    "display_name": a.display_name,
                    "specialty_domains": a.specialty_domains,
                    "status": a.status,
                    "pheromone_score": effective_pheromone(&a, now, &self.pheromone),
                })
            })
            .collect();
        let body = serde_json::json!({ "count": agents.len(), "agents": agents });
        Ok(ToolResult::success(&call.id, body.to_string()))
    }
}

/// Register `clock` and `agent_roster`.
pub fn register_builtins(
    tools: &mut ToolRegistry,
    registry: Arc<AgentRegistry>,
    pheromone: PheromoneConfig,
) {
    tools.register(Arc::new(ClockTool::new()));
    tools.register(Arc::new(AgentRosterTool::new(registry, pheromone)));
}
