use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Runtime status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    /// Holds at least one pool concurrency slot.
    Busy,
    /// Last dispatch failed; still eligible for work.
    Error,
    /// Terminated. Agents are never deleted, only disabled.
    Disabled,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// Durable record of one agent.
///
/// Field ownership is split between components: the pool writes `status`,
/// `current_session_id`, `consecutive_failures` and `last_active_at`; the
/// router writes `pheromone_score` and `pheromone_updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: String,
    pub display_name: String,
    pub specialty_domains: BTreeSet<String>,
    /// Opaque, forwarded to the completion backend.
    #[serde(default)]
    pub model_config: serde_json::Value,
    pub status: AgentStatus,
    pub pheromone_score: f64,
    pub pheromone_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub current_session_id: Option<Uuid>,
    #[serde(default)]
    pub last_active_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AgentState {
    /// A freshly registered, idle agent.
    pub fn new(spec: &AgentSpec, initial_pheromone: f64) -> Self {
        let now = Utc::now();
        Self {
            id: spec.id.clone(),
            display_name: spec.display_name(),
            specialty_domains: spec.domains(),
            model_config: spec.model.clone(),
            status: if spec.disabled {
                AgentStatus::Disabled
            } else {
                AgentStatus::Idle
            },
            pheromone_score: initial_pheromone,
            pheromone_updated_at: now,
            consecutive_failures: 0,
            current_session_id: None,
            last_active_at: None,
            created_at: now,
        }
    }
}

/// Declarative agent definition (`[[agents]]` in the config file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub specialty_domains: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Tool names, resolved against the tool registry at spawn time.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model: serde_json::Value,
    #[serde(default)]
    pub disabled: bool,
}

impl AgentSpec {
    /// Minimal spec with an id and specialty tags.
    pub fn new(id: impl Into<String>, domains: &[&str]) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            specialty_domains: domains.iter().map(|d| (*d).to_string()).collect(),
            system_prompt: None,
            tools: Vec::new(),
            model: serde_json::Value::Null,
            disabled: false,
        }
    }

    /// Display name, defaulting to the id.
    pub fn display_name(&self) -> String {
        self.display_name.clone().unwrap_or_else(|| self.id.clone())
    }

    /// Normalized (lowercase, trimmed) specialty tags.
    pub fn domains(&self) -> BTreeSet<String> {
        self.specialty_domains
            .iter()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect()
    }

    /// Whether the id is usable as a stable key and file name.
    pub fn has_valid_id(&self) -> bool {
        !self.id.is_empty()
            && self.id.len() <= 64
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

/// Metrics tracked per agent across dispatches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub dispatches: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub tool_calls: u64,
    pub duration_ms: u64,
}

/// One row of `AgentPool::list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub display_name: String,
    pub specialty_domains: BTreeSet<String>,
    pub status: AgentStatus,
    pub pheromone_score: f64,
    pub consecutive_failures: u32,
    pub current_session_id: Option<Uuid>,
    pub last_active_at: Option<DateTime<Utc>>,
    /// Whether a live worker exists for this agent.
    pub spawned: bool,
    pub in_flight: usize,
    pub metrics: AgentMetrics,
}

/// Result of one interaction, fed back into the router's reputation store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionOutcome {
    pub agent_id: String,
    /// Quality of the interaction in `[0, 1]`.
    pub value: f64,
    pub at: DateTime<Utc>,
}

impl InteractionOutcome {
    /// An outcome observed now.
    pub fn now(agent_id: impl Into<String>, value: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            value: value.clamp(0.0, 1.0),
            at: Utc::now(),
        }
    }

    pub fn success(agent_id: impl Into<String>) -> Self {
        Self::now(agent_id, 1.0)
    }

    pub fn failure(agent_id: impl Into<String>) -> Self {
        Self::now(agent_id, 0.0)
    }
}
