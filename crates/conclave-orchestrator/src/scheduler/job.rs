use super::schedule::Schedule;
use chrono::{DateTime, Utc};
use conclave_core::{ConclaveError, ConclaveResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Target meaning "let the router pick".
pub const AUTO_AGENT: &str = "auto";

/// What a job does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Send a prompt to one agent.
    Prompt { text: String },
    /// Have an agent invoke a registered tool.
    Skill {
        tool: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    /// Run a named pipeline of prompts.
    Pipeline { name: String },
    /// Run a roundtable discussion.
    Roundtable {
        topic: String,
        agents: Vec<String>,
        #[serde(default = "default_rounds")]
        rounds: u32,
        #[serde(default)]
        synthesizer: Option<String>,
    },
    /// Run a swarm vote.
    Swarm {
        topic: String,
        agents: Vec<String>,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
        #[serde(default = "default_consensus_threshold")]
        consensus_threshold: f64,
    },
}

fn default_rounds() -> u32 {
    3
}

fn default_max_iterations() -> u32 {
    5
}

fn default_consensus_threshold() -> f64 {
    0.7
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::Prompt { .. } => "prompt",
            JobPayload::Skill { .. } => "skill",
            JobPayload::Pipeline { .. } => "pipeline",
            JobPayload::Roundtable { .. } => "roundtable",
            JobPayload::Swarm { .. } => "swarm",
        }
    }
}

/// Outcome of one job firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
    Timeout,
}

/// Declarative job definition, as written in `[[jobs]]` or posted to the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub schedule: String,
    #[serde(default = "default_agent")]
    pub agent: String,
    pub payload: JobPayload,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

fn default_agent() -> String {
    AUTO_AGENT.to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_max_duration_secs() -> u64 {
    300
}

fn default_retry_count() -> u32 {
    2
}

impl JobDefinition {
    /// A prompt job with default settings.
    pub fn prompt(name: &str, schedule: &str, text: &str) -> Self {
        Self {
            name: name.to_string(),
            schedule: schedule.to_string(),
            agent: default_agent(),
            payload: JobPayload::Prompt {
                text: text.to_string(),
            },
            enabled: true,
            max_duration_secs: default_max_duration_secs(),
            retry_count: default_retry_count(),
        }
    }

    /// Check field ranges and parse the schedule.
    pub fn validate(&self) -> ConclaveResult<Schedule> {
        if self.name.trim().is_empty() {
            return Err(ConclaveError::Config("job name must not be empty".into()));
        }
        if self.max_duration_secs == 0 {
            return Err(ConclaveError::Config(format!(
                "job '{}': max_duration_secs must be positive",
                self.name
            )));
        }
        if self.agent.trim().is_empty() {
            return Err(ConclaveError::Config(format!(
                "job '{}': agent must be an agent id or \"{AUTO_AGENT}\"",
                self.name
            )));
        }
        Schedule::parse(&self.schedule)
    }
}

/// A persisted scheduled job with its runtime counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJob {
    pub id: Uuid,
    pub name: String,
    pub schedule: Schedule,
    /// Pinned agent id, or [`AUTO_AGENT`].
    pub agent_id: String,
    pub payload: JobPayload,
    pub enabled: bool,
    pub max_duration_secs: u64,
    pub retry_count: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub run_count: u64,
    pub success_count: u64,
    pub fail_count: u64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CronJob {
    /// Build a new job from a definition. Counters start at zero.
    pub fn from_definition(definition: &JobDefinition, now: DateTime<Utc>) -> ConclaveResult<Self> {
        let schedule = definition.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            name: definition.name.clone(),
            next_run_at: schedule.next_after(now),
            schedule,
            agent_id: definition.agent.clone(),
            payload: definition.payload.clone(),
            enabled: definition.enabled,
            max_duration_secs: definition.max_duration_secs,
            retry_count: definition.retry_count,
            last_run_at: None,
            last_status: None,
            run_count: 0,
            success_count: 0,
            fail_count: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply the definition's fields, keeping id and runtime counters.
    ///
    /// Returns `false` (and leaves the job untouched) when nothing differs.
    /// `next_run_at` is recomputed only when the schedule changed.
    pub fn apply_definition(
        &mut self,
        definition: &JobDefinition,
        now: DateTime<Utc>,
    ) -> ConclaveResult<bool> {
        let schedule = definition.validate()?;
        let schedule_changed = schedule != self.schedule;
        let changed = schedule_changed
            || self.name != definition.name
            || self.agent_id != definition.agent
            || self.payload != definition.payload
            || self.enabled != definition.enabled
            || self.max_duration_secs != definition.max_duration_secs
            || self.retry_count != definition.retry_count;
        if !changed {
            return Ok(false);
        }
        if schedule_changed {
            self.next_run_at = schedule.next_after(now);
            self.schedule = schedule;
        }
        self.name = definition.name.clone();
        self.agent_id = definition.agent.clone();
        self.payload = definition.payload.clone();
        self.enabled = definition.enabled;
        self.max_duration_secs = definition.max_duration_secs;
        self.retry_count = definition.retry_count;
        self.updated_at = now;
        Ok(true)
    }

    pub fn definition(&self) -> JobDefinition {
        JobDefinition {
            name: self.name.clone(),
            schedule: self.schedule.source().to_string(),
            agent: self.agent_id.clone(),
            payload: self.payload.clone(),
            enabled: self.enabled,
            max_duration_secs: self.max_duration_secs,
            retry_count: self.retry_count,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.agent_id != AUTO_AGENT
    }

    /// Whether the job should fire at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|next| next <= now)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_defaults() {
        let def: JobDefinition = parse_definition(
            r#"{"name": "digest", "schedule": "@every 1h", "payload": {"type": "prompt", "text": "summarize"}}"#,
        );
        assert_eq!(def.agent, AUTO_AGENT);
        assert!(def.enabled);
        assert_eq!(def.retry_count, 2);
        assert_eq!(def.max_duration_secs, 300);
    }

    fn parse_definition(json: &str) -> JobDefinition {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_payload_tagging() {
        let payload: JobPayload = serde_json::from_value(serde_json::json!({
            "type": "swarm", "topic": "ship it?", "agents": ["a", "b"]
        }))
        .unwrap();
        match payload {
            JobPayload::Swarm {
                max_iterations,
                consensus_threshold,
                ..
            } => {
                assert_eq!(max_iterations, 5);
                assert_eq!(consensus_threshold, 0.7);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_apply_definition_preserves_counters() {
        let now = Utc::now();
        let def = JobDefinition::prompt("digest", "@every 1h", "summarize");
        let mut job = CronJob::from_definition(&def, now).unwrap();
        job.run_count = 7;
        job.success_count = 5;

        assert!(!job.apply_definition(&def, now).unwrap());

        let mut changed = def.clone();
        changed.schedule = "@every 2h".into();
        let original_id = job.id;
        assert!(job.apply_definition(&changed, now).unwrap());
        assert_eq!(job.id, original_id);
        assert_eq!(job.run_count, 7);
        assert_eq!(job.success_count, 5);
        assert_eq!(job.schedule.source(), "@every 2h");
        assert_eq!(job.next_run_at, Some(now + chrono::Duration::hours(2)));
    }

    #[test]
    fn test_validation_errors() {
        let mut def = JobDefinition::prompt("", "@every 1h", "x");
        assert!(def.validate().is_err());
        def.name = "ok".into();
        def.max_duration_secs = 0;
        assert!(def.validate().is_err());
        def.max_duration_secs = 10;
        def.schedule = "bogus".into();
        assert!(matches!(def.validate(), Err(ConclaveError::Config(_))));
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut job =
            CronJob::from_definition(&JobDefinition::prompt("j", "@every 1m", "x"), now).unwrap();
        assert!(!job.is_due(now));
        assert!(job.is_due(now + chrono::Duration::minutes(1)));
        job.enabled = false;
        assert!(!job.is_due(now + chrono::Duration::minutes(5)));
    }
}
