//! Multi-round structured discussion among a fixed set of agents.
//!
//! Each round fans out to every participant through the pool, tagged with a
//! [`Phase`]. After the last round a synthesizer condenses the transcript
//! into one answer, and every participant's reputation is updated according
//! to whether the synthesis drew on its contribution.

use crate::events::{EventSink, SessionEvent};
use crate::pool::{AgentPool, DispatchRequest};
use crate::router::Router;
use crate::types::InteractionOutcome;
use conclave_core::{ConclaveError, ConclaveResult};
use conclave_session::{Phase, SessionKind, SessionRecord, SessionStatus, SessionStore, Turn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const MIN_PARTICIPANTS: usize = 2;
pub const MAX_PARTICIPANTS: usize = 12;
pub const MAX_ROUNDS: u32 = 10;

/// Outcome value for a participant whose turns shaped the synthesis.
const INCORPORATED: f64 = 1.0;
/// Outcome value for a participant that spoke but was not drawn on.
const NOT_INCORPORATED: f64 = 0.4;
/// Share of a participant's significant words that must reappear in the
/// synthesis for its contribution to count as incorporated.
const OVERLAP_THRESHOLD: f64 = 0.25;
const SIGNIFICANT_WORD_LEN: usize = 5;

/// Parameters of one roundtable discussion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundtableRequest {
    pub topic: String,
    /// Ordered participants.
    pub agents: Vec<String>,
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    /// Defaults to the participant with the highest pheromone score.
    #[serde(default)]
    pub synthesizer: Option<String>,
    /// Per-turn deadline; the pool default applies when unset.
    #[serde(default)]
    pub turn_timeout_secs: Option<u64>,
    #[serde(default)]
    pub synthesis_timeout_secs: Option<u64>,
}

fn default_rounds() -> u32 {
    3
}

impl RoundtableRequest {
    pub fn new(topic: impl Into<String>, agents: &[&str], rounds: u32) -> Self {
        Self {
            topic: topic.into(),
            agents: agents.iter().map(|a| a.to_string()).collect(),
            rounds,
            synthesizer: None,
            turn_timeout_secs: None,
            synthesis_timeout_secs: None,
        }
    }

    pub fn with_synthesizer(mut self, agent_id: impl Into<String>) -> Self {
        self.synthesizer = Some(agent_id.into());
        self
    }
}

/// A validated roundtable whose session record already exists.
#[derive(Debug, Clone)]
pub struct RoundtablePlan {
    pub record: SessionRecord,
    pub rounds: u32,
    pub synthesizer: String,
    turn_timeout: Option<Duration>,
    synthesis_timeout: Option<Duration>,
}

impl RoundtablePlan {
    pub fn session_id(&self) -> Uuid {
        self.record.id
    }
}

/// Terminal outcome of a roundtable. Partial transcripts are kept on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundtableResult {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub topic: String,
    pub participants: Vec<String>,
    pub synthesizer: String,
    pub synthesis: Option<String>,
    pub turns: Vec<Turn>,
    pub rounds_completed: u32,
    pub failure_reason: Option<String>,
    pub duration_ms: u64,
}

/// Check a participant list against the session size limits and the pool.
pub(crate) fn validate_participants(pool: &AgentPool, agents: &[String]) -> ConclaveResult<()> {
    if agents.len() < MIN_PARTICIPANTS || agents.len() > MAX_PARTICIPANTS {
        return Err(ConclaveError::Config(format!(
            "sessions need {MIN_PARTICIPANTS} to {MAX_PARTICIPANTS} participants, got {}",
            agents.len()
        )));
    }
    let mut seen = HashSet::new();
    for agent_id in agents {
        if !seen.insert(agent_id.as_str()) {
            return Err(ConclaveError::Config(format!(
                "participant {agent_id} listed twice"
            )));
        }
        ensure_available(pool, agent_id)?;
    }
    Ok(())
}

pub(crate) fn ensure_available(pool: &AgentPool, agent_id: &str) -> ConclaveResult<()> {
    if !pool.registry().contains(agent_id) {
        return Err(ConclaveError::NotFound(format!("agent {agent_id}")));
    }
    if !pool.is_available(agent_id) {
        return Err(ConclaveError::Config(format!(
            "agent {agent_id} is disabled"
        )));
    }
    Ok(())
}

/// Participant with the highest current pheromone; ties go to the earlier one.
pub(crate) fn strongest(router: &Router, agents: &[String]) -> Option<String> {
    let mut best: Option<(&String, f64)> = None;
    for agent_id in agents {
        let score = router.pheromone(agent_id);
        match best {
            Some((_, top)) if top >= score => {}
            _ => best = Some((agent_id, score)),
        }
    }
    best.map(|(id, _)| id.clone())
}

fn render_transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| {
            format!(
                "[round {} {} | {}]\n{}",
                t.round_index, t.phase, t.agent_id, t.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn round_prompt(topic: &str, round: u32, rounds: u32, phase: Phase, turns: &[Turn]) -> String {
    let mut prompt = format!(
        "Roundtable topic: {topic}\nRound {round} of {rounds}.\n{}\n",
        phase.instruction()
    );
    if !turns.is_empty() {
        prompt.push_str("\nDiscussion so far:\n");
        prompt.push_str(&render_transcript(turns));
        prompt.push('\n');
    }
    prompt.push_str("\nGive your contribution for this round.");
    prompt
}

fn synthesis_prompt(topic: &str, turns: &[Turn]) -> String {
    format!(
        "You are synthesizing a roundtable on: {topic}\n\nFull transcript:\n{}\n\n\
         Write one combined answer that keeps the strongest points and resolves disagreements. \
         Credit participants by id where you use their ideas.",
        render_transcript(turns)
    )
}

fn significant_words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= SIGNIFICANT_WORD_LEN)
        .map(str::to_lowercase)
        .collect()
}

/// Whether the synthesis drew on an agent's contributions: it names the
/// agent, or repeats enough of the agent's significant words.
pub fn is_incorporated(
    synthesis: &str,
    agent_id: &str,
    display_name: Option<&str>,
    contributions: &[&str],
) -> bool {
    let lower = synthesis.to_lowercase();
    let agent_id = agent_id.to_lowercase();
    let names_id = lower
        .split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
        .any(|word| word == agent_id);
    let names_display = display_name
        .map(str::to_lowercase)
        .is_some_and(|n| n.chars().count() >= 3 && n != agent_id && lower.contains(&n));
    if names_id || names_display {
        return true;
    }
    let spoken = significant_words(&contributions.join(" "));
    if spoken.is_empty() {
        return false;
    }
    let synthesized = significant_words(synthesis);
    let shared = spoken.intersection(&synthesized).count();
    shared as f64 / spoken.len() as f64 >= OVERLAP_THRESHOLD
}

pub struct RoundtableEngine {
    pool: Arc<AgentPool>,
    router: Arc<Router>,
    sessions: Arc<dyn SessionStore>,
}

impl RoundtableEngine {
    pub fn new(pool: Arc<AgentPool>, router: Arc<Router>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            pool,
            router,
            sessions,
        }
    }

    /// Validate a request and persist its running session record.
    ///
    /// Nothing is dispatched; every configuration error surfaces here.
    pub async fn prepare(&self, request: &RoundtableRequest) -> ConclaveResult<RoundtablePlan> {
        if request.topic.trim().is_empty() {
            return Err(ConclaveError::Config("roundtable topic must not be empty".into()));
        }
        if request.rounds == 0 || request.rounds > MAX_ROUNDS {
            return Err(ConclaveError::Config(format!(
                "rounds must be between 1 and {MAX_ROUNDS}, got {}",
                request.rounds
            )));
        }
        validate_participants(&self.pool, &request.agents)?;
        let synthesizer = match &request.synthesizer {
            Some(id) => {
                ensure_available(&self.pool, id)?;
                id.clone()
            }
            None => strongest(&self.router, &request.agents).ok_or_else(|| {
                ConclaveError::Config("roundtable has no participants".into())
            })?,
        };

        let mut record = SessionRecord::new(
            SessionKind::Roundtable,
            request.topic.clone(),
            request.agents.clone(),
        );
        record
            .metadata
            .insert("rounds".into(), serde_json::json!(request.rounds));
        record
            .metadata
            .insert("synthesizer".into(), serde_json::json!(synthesizer));
        self.sessions.create(&record).await?;
        info!(
            session_id = %record.id,
            participants = record.participant_agent_ids.len(),
            rounds = request.rounds,
            synthesizer = %synthesizer,
            "Roundtable created"
        );

        Ok(RoundtablePlan {
            record,
            rounds: request.rounds,
            synthesizer,
            turn_timeout: request.turn_timeout_secs.map(Duration::from_secs),
            synthesis_timeout: request.synthesis_timeout_secs.map(Duration::from_secs),
        })
    }

    /// Validate, run to completion, and return the result.
    pub async fn discuss(
        &self,
        request: &RoundtableRequest,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> ConclaveResult<RoundtableResult> {
        let plan = self.prepare(request).await?;
        Ok(self.run(plan, sink, cancel).await)
    }

    /// Run a prepared roundtable. Session-level failures are reported in the
    /// result, never as `Err`.
    pub async fn run(
        &self,
        plan: RoundtablePlan,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> RoundtableResult {
        let started = Instant::now();
        let RoundtablePlan {
            mut record,
            rounds,
            synthesizer,
            turn_timeout,
            synthesis_timeout,
        } = plan;
        let session_id = record.id;
        let mut rounds_completed = 0;

        for round in 1..=rounds {
            if cancel.is_cancelled() {
                record.finish(SessionStatus::Cancelled, Some("cancelled".into()));
                break;
            }
            let available: Vec<String> = record
                .participant_agent_ids
                .iter()
                .filter(|id| self.pool.is_available(id))
                .cloned()
                .collect();
            if available.len() < MIN_PARTICIPANTS {
                record.finish(
                    SessionStatus::Failed,
                    Some(format!(
                        "round {round}: only {} participants can still respond",
                        available.len()
                    )),
                );
                break;
            }

            let phase = Phase::for_round(round, rounds);
            let prompt = round_prompt(&record.topic, round, rounds, phase, &record.turns);
            let tasks = available
                .iter()
                .map(|agent_id| {
                    let mut task = DispatchRequest::new(agent_id.clone(), prompt.clone())
                        .with_session(session_id)
                        .with_cancel(cancel.clone());
                    if let Some(timeout) = turn_timeout {
                        task = task.with_timeout(timeout);
                    }
                    task
                })
                .collect();

            let mut new_turns = Vec::new();
            let batch = self
                .pool
                .run_parallel_with(tasks, |outcome| match &outcome.result {
                    Ok(result) => {
                        let turn = Turn {
                            round_index: round,
                            phase,
                            agent_id: outcome.agent_id.clone(),
                            content: result.output(),
                            duration_ms: result.duration_ms,
                        };
                        sink(SessionEvent::Turn {
                            session_id,
                            round,
                            phase,
                            agent_id: turn.agent_id.clone(),
                            content: turn.content.clone(),
                        });
                        new_turns.push(turn);
                    }
                    Err(e) => {
                        warn!(
                            session_id = %session_id,
                            agent_id = %outcome.agent_id,
                            round,
                            error = %e,
                            "Participant produced no turn"
                        );
                    }
                })
                .await;

            let responders = new_turns.len();
            for turn in new_turns {
                if let Err(e) = record.append_turn(turn) {
                    warn!(session_id = %session_id, error = %e, "Dropped turn");
                }
            }

            if cancel.is_cancelled() || batch.any_cancelled() {
                record.finish(SessionStatus::Cancelled, Some("cancelled".into()));
            } else if responders < MIN_PARTICIPANTS {
                record.finish(
                    SessionStatus::Failed,
                    Some(format!(
                        "round {round}: only {responders} of {} participants responded",
                        available.len()
                    )),
                );
            } else {
                rounds_completed = round;
                info!(session_id = %session_id, round, %phase, responders, "Round complete");
            }
            self.save(&record).await;
            if record.status.is_terminal() {
                break;
            }
        }

        let mut outcomes = Vec::new();
        if record.status == SessionStatus::Running {
            let mut task = DispatchRequest::new(
                synthesizer.clone(),
                synthesis_prompt(&record.topic, &record.turns),
            )
            .with_session(session_id)
            .with_cancel(cancel.clone());
            if let Some(timeout) = synthesis_timeout {
                task = task.with_timeout(timeout);
            }
            match self.pool.dispatch(task).await {
                Ok(result) => {
                    let text = result.output();
                    outcomes = self.participant_outcomes(&record, &text);
                    sink(SessionEvent::Synthesis {
                        session_id,
                        agent_id: synthesizer.clone(),
                        content: text.clone(),
                    });
                    record.synthesis = Some(text);
                    record.finish(SessionStatus::Synthesized, None);
                }
                Err(ConclaveError::Cancelled(_)) => {
                    record.finish(SessionStatus::Cancelled, Some("cancelled".into()));
                }
                Err(e) => {
                    outcomes.push(InteractionOutcome::failure(&synthesizer));
                    record.finish(
                        SessionStatus::Failed,
                        Some(format!("synthesizer {synthesizer} failed: {e}")),
                    );
                }
            }
            self.save(&record).await;
        }

        if !outcomes.is_empty() {
            self.router.update_scores(outcomes);
        }

        match record.status {
            SessionStatus::Synthesized => info!(
                session_id = %session_id,
                turns = record.turns.len(),
                "Roundtable synthesized"
            ),
            _ => {
                let message = record
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| format!("{:?}", record.status));
                if record.status == SessionStatus::Failed {
                    error!(session_id = %session_id, reason = %message, "Roundtable failed");
                } else {
                    info!(session_id = %session_id, "Roundtable cancelled");
                }
                sink(SessionEvent::Error {
                    session_id,
                    message,
                });
            }
        }

        RoundtableResult {
            session_id,
            status: record.status,
            topic: record.topic,
            participants: record.participant_agent_ids,
            synthesizer,
            synthesis: record.synthesis,
            turns: record.turns,
            rounds_completed,
            failure_reason: record.failure_reason,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn participant_outcomes(&self, record: &SessionRecord, synthesis: &str) -> Vec<InteractionOutcome> {
        record
            .participant_agent_ids
            .iter()
            .map(|agent_id| {
                let contributions: Vec<&str> = record
                    .turns
                    .iter()
                    .filter(|t| &t.agent_id == agent_id)
                    .map(|t| t.content.as_str())
                    .collect();
                if contributions.is_empty() {
                    return InteractionOutcome::failure(agent_id);
                }
                let display_name = self.pool.registry().get(agent_id).map(|a| a.display_name);
                let value = if is_incorporated(
                    synthesis,
                    agent_id,
                    display_name.as_deref(),
                    &contributions,
                ) {
                    INCORPORATED
                } else {
                    NOT_INCORPORATED
                };
                InteractionOutcome::now(agent_id, value)
            })
            .collect()
    }

    async fn save(&self, record: &SessionRecord) {
        if let Err(e) = self.sessions.update(record).await {
            warn!(session_id = %record.id, error = %e, "Failed to persist session");
        }
    }
}
