//! Iterative weighted-vote consensus.
//!
//! Every iteration asks all participants to vote on the topic in parallel,
//! parses each reply with [`VoteParser`], and scores agreement weighted by
//! pheromone. The loop stops at the threshold or after `max_iterations`;
//! either way the strongest participant writes the consensus text.

use crate::events::{EventSink, SessionEvent};
use crate::pool::{AgentPool, DispatchRequest};
use crate::roundtable::{strongest, validate_participants, MIN_PARTICIPANTS};
use crate::router::Router;
use crate::types::InteractionOutcome;
use crate::vote_parser::VoteParser;
use conclave_core::{ConclaveError, ConclaveResult};
use conclave_session::{
    ConsensusResult, SessionKind, SessionRecord, SessionStatus, SessionStore, StigmergyMarker,
    TrailDirection, Vote, VoteKind,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const MAX_ITERATIONS: u32 = 20;

/// Outcome value for a participant that voted with the final plurality.
const WITH_PLURALITY: f64 = 1.0;
const AGAINST_PLURALITY: f64 = 0.4;

/// `[consensus]` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_agreement_weight")]
    pub agreement_weight: f64,
    #[serde(default = "default_confidence_weight")]
    pub confidence_weight: f64,
    /// Score movements smaller than this are reported as flat.
    #[serde(default = "default_flat_epsilon")]
    pub flat_epsilon: f64,
}

fn default_agreement_weight() -> f64 {
    0.6
}

fn default_confidence_weight() -> f64 {
    0.4
}

fn default_flat_epsilon() -> f64 {
    0.01
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            agreement_weight: default_agreement_weight(),
            confidence_weight: default_confidence_weight(),
            flat_epsilon: default_flat_epsilon(),
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> ConclaveResult<()> {
        if self.agreement_weight < 0.0 || self.confidence_weight < 0.0 {
            return Err(ConclaveError::Config(
                "consensus weights must be non-negative".into(),
            ));
        }
        if self.agreement_weight + self.confidence_weight <= 0.0 {
            return Err(ConclaveError::Config(
                "consensus weights must not both be zero".into(),
            ));
        }
        if self.flat_epsilon < 0.0 {
            return Err(ConclaveError::Config(
                "flat_epsilon must be non-negative".into(),
            ));
        }
        Ok(())
    }

    pub fn direction(&self, delta: f64) -> TrailDirection {
        if delta > self.flat_epsilon {
            TrailDirection::Improving
        } else if delta < -self.flat_epsilon {
            TrailDirection::Regressing
        } else {
            TrailDirection::Flat
        }
    }
}

/// One parsed vote with the voter's pheromone weight.
#[derive(Debug, Clone, Copy)]
pub struct WeightedVote {
    pub vote: VoteKind,
    pub confidence: f64,
    pub weight: f64,
}

/// Share of votes in favour: `agree` counts fully, `extend` half.
pub fn agreement_ratio(votes: &[WeightedVote]) -> f64 {
    if votes.is_empty() {
        return 0.0;
    }
    let support: f64 = votes
        .iter()
        .map(|v| match v.vote {
            VoteKind::Agree => 1.0,
            VoteKind::Extend => 0.5,
            VoteKind::Disagree | VoteKind::Pivot => 0.0,
        })
        .sum();
    support / votes.len() as f64
}

/// Mean confidence weighted by pheromone; a plain mean when every weight is zero.
pub fn weighted_confidence(votes: &[WeightedVote]) -> f64 {
    if votes.is_empty() {
        return 0.0;
    }
    let total_weight: f64 = votes.iter().map(|v| v.weight.max(0.0)).sum();
    if total_weight <= f64::EPSILON {
        return votes.iter().map(|v| v.confidence).sum::<f64>() / votes.len() as f64;
    }
    votes
        .iter()
        .map(|v| v.weight.max(0.0) * v.confidence)
        .sum::<f64>()
        / total_weight
}

/// `agreement_weight × agreement + confidence_weight × confidence`,
/// normalized by the weight sum.
pub fn consensus_score(votes: &[WeightedVote], config: &ConsensusConfig) -> f64 {
    let total = config.agreement_weight + config.confidence_weight;
    if total <= 0.0 || votes.is_empty() {
        return 0.0;
    }
    let score = config.agreement_weight * agreement_ratio(votes)
        + config.confidence_weight * weighted_confidence(votes);
    (score / total).clamp(0.0, 1.0)
}

/// Most common vote; ties favour agree, then extend, pivot, disagree.
fn plurality(votes: &[&Vote]) -> Option<VoteKind> {
    let order = [
        VoteKind::Agree,
        VoteKind::Extend,
        VoteKind::Pivot,
        VoteKind::Disagree,
    ];
    let mut best: Option<(VoteKind, usize)> = None;
    for kind in order {
        let count = votes.iter().filter(|v| v.vote == kind).count();
        if count > 0 && best.map_or(true, |(_, top)| count > top) {
            best = Some((kind, count));
        }
    }
    best.map(|(kind, _)| kind)
}

/// Parameters of one swarm session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmRequest {
    pub topic: String,
    pub agents: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    #[serde(default)]
    pub vote_timeout_secs: Option<u64>,
    #[serde(default)]
    pub synthesis_timeout_secs: Option<u64>,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_consensus_threshold() -> f64 {
    0.7
}

impl SwarmRequest {
    pub fn new(topic: impl Into<String>, agents: &[&str]) -> Self {
        Self {
            topic: topic.into(),
            agents: agents.iter().map(|a| a.to_string()).collect(),
            max_iterations: default_max_iterations(),
            consensus_threshold: default_consensus_threshold(),
            vote_timeout_secs: None,
            synthesis_timeout_secs: None,
        }
    }

    pub fn with_limits(mut self, max_iterations: u32, consensus_threshold: f64) -> Self {
        self.max_iterations = max_iterations;
        self.consensus_threshold = consensus_threshold;
        self
    }
}

/// A validated swarm whose session record already exists.
#[derive(Debug, Clone)]
pub struct SwarmPlan {
    pub record: SessionRecord,
    pub max_iterations: u32,
    pub consensus_threshold: f64,
    vote_timeout: Option<Duration>,
    synthesis_timeout: Option<Duration>,
}

impl SwarmPlan {
    pub fn session_id(&self) -> Uuid {
        self.record.id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmResult {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub topic: String,
    pub votes: Vec<Vote>,
    /// Present once the vote loop ended, even if synthesis then failed.
    pub consensus: Option<ConsensusResult>,
    pub failure_reason: Option<String>,
    pub duration_ms: u64,
}

fn vote_prompt(topic: &str, iteration: u32, max_iterations: u32, previous: &[&Vote]) -> String {
    let mut prompt = format!("Swarm topic: {topic}\nIteration {iteration} of {max_iterations}.\n");
    if !previous.is_empty() {
        prompt.push_str("\nVotes from the previous iteration:\n");
        for vote in previous {
            prompt.push_str(&format!(
                "- {}: {} ({:.2}) {}\n",
                vote.agent_id, vote.vote, vote.confidence, vote.reasoning
            ));
        }
    }
    prompt.push_str(
        "\nState your position in this exact format:\n\
         VOTE: agree | disagree | extend | pivot\n\
         CONFIDENCE: a number between 0 and 1\n\
         REASONING: one short paragraph",
    );
    prompt
}

fn synthesis_prompt(topic: &str, votes: &[&Vote], score: f64, converged: bool) -> String {
    let mut prompt = format!(
        "You are writing the consensus of a swarm vote on: {topic}\n\
         Consensus score {score:.2} ({}).\n\nFinal votes:\n",
        if converged { "converged" } else { "did not converge" }
    );
    for vote in votes {
        prompt.push_str(&format!(
            "- {}: {} ({:.2}) {}\n",
            vote.agent_id, vote.vote, vote.confidence, vote.reasoning
        ));
    }
    prompt.push_str("\nWrite the decision the group supports and the main reservations.");
    prompt
}

pub struct SwarmEngine {
    pool: Arc<AgentPool>,
    router: Arc<Router>,
    sessions: Arc<dyn SessionStore>,
    config: ConsensusConfig,
    parser: VoteParser,
}

impl SwarmEngine {
    pub fn new(
        pool: Arc<AgentPool>,
        router: Arc<Router>,
        sessions: Arc<dyn SessionStore>,
        config: ConsensusConfig,
    ) -> ConclaveResult<Self> {
        config.validate()?;
        Ok(Self {
            pool,
            router,
            sessions,
            config,
            parser: VoteParser::new(),
        })
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Validate a request and persist its running session record.
    pub async fn prepare(&self, request: &SwarmRequest) -> ConclaveResult<SwarmPlan> {
        if request.topic.trim().is_empty() {
            return Err(ConclaveError::Config("swarm topic must not be empty".into()));
        }
        if request.max_iterations == 0 || request.max_iterations > MAX_ITERATIONS {
            return Err(ConclaveError::Config(format!(
                "max_iterations must be between 1 and {MAX_ITERATIONS}, got {}",
                request.max_iterations
            )));
        }
        if !(request.consensus_threshold > 0.0 && request.consensus_threshold <= 1.0) {
            return Err(ConclaveError::Config(format!(
                "consensus_threshold must be in (0, 1], got {}",
                request.consensus_threshold
            )));
        }
        validate_participants(&self.pool, &request.agents)?;

        let mut record =
            SessionRecord::new(SessionKind::Swarm, request.topic.clone(), request.agents.clone());
        record.metadata.insert(
            "max_iterations".into(),
            serde_json::json!(request.max_iterations),
        );
        record.metadata.insert(
            "consensus_threshold".into(),
            serde_json::json!(request.consensus_threshold),
        );
        self.sessions.create(&record).await?;
        info!(
            session_id = %record.id,
            participants = record.participant_agent_ids.len(),
            max_iterations = request.max_iterations,
            threshold = request.consensus_threshold,
            "Swarm created"
        );

        Ok(SwarmPlan {
            record,
            max_iterations: request.max_iterations,
            consensus_threshold: request.consensus_threshold,
            vote_timeout: request.vote_timeout_secs.map(Duration::from_secs),
            synthesis_timeout: request.synthesis_timeout_secs.map(Duration::from_secs),
        })
    }

    /// Validate, run to completion, and return the result.
    pub async fn execute(
        &self,
        request: &SwarmRequest,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> ConclaveResult<SwarmResult> {
        let plan = self.prepare(request).await?;
        Ok(self.run(plan, sink, cancel).await)
    }

    /// Run a prepared swarm. Non-convergence is a normal terminal state.
    pub async fn run(&self, plan: SwarmPlan, sink: EventSink, cancel: CancellationToken) -> SwarmResult {
        let started = Instant::now();
        let SwarmPlan {
            mut record,
            max_iterations,
            consensus_threshold,
            vote_timeout,
            synthesis_timeout,
        } = plan;
        let session_id = record.id;

        let mut trail: Vec<StigmergyMarker> = Vec::new();
        let mut previous_score = 0.0;
        let mut best_score = 0.0;
        let mut converged = false;
        let mut iterations_used = 0;

        for iteration in 1..=max_iterations {
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
                        "iteration {iteration}: only {} participants can still vote",
                        available.len()
                    )),
                );
                break;
            }

            let weights: HashMap<String, f64> = available
                .iter()
                .map(|id| (id.clone(), self.router.pheromone(id)))
                .collect();
            let previous: Vec<&Vote> = record.votes_in_iteration(iteration - 1).collect();
            let prompt = vote_prompt(&record.topic, iteration, max_iterations, &previous);
            let tasks = available
                .iter()
                .map(|agent_id| {
                    let mut task = DispatchRequest::new(agent_id.clone(), prompt.clone())
                        .with_session(session_id)
                        .with_cancel(cancel.clone());
                    if let Some(timeout) = vote_timeout {
                        task = task.with_timeout(timeout);
                    }
                    task
                })
                .collect();

            let mut new_votes = Vec::new();
            let batch = self
                .pool
                .run_parallel_with(tasks, |outcome| match &outcome.result {
                    Ok(result) => {
                        let parsed = self.parser.parse(&result.text);
                        sink(SessionEvent::Vote {
                            session_id,
                            iteration,
                            agent_id: outcome.agent_id.clone(),
                            vote: parsed.vote,
                            confidence: parsed.confidence,
                        });
                        new_votes.push(Vote {
                            iteration,
                            agent_id: outcome.agent_id.clone(),
                            vote: parsed.vote,
                            confidence: parsed.confidence,
                            reasoning: parsed.reasoning,
                            duration_ms: result.duration_ms,
                        });
                    }
                    Err(e) => {
                        warn!(
                            session_id = %session_id,
                            agent_id = %outcome.agent_id,
                            iteration,
                            error = %e,
                            "Participant cast no vote"
                        );
                    }
                })
                .await;

            let weighted: Vec<WeightedVote> = new_votes
                .iter()
                .map(|v| WeightedVote {
                    vote: v.vote,
                    confidence: v.confidence,
                    weight: weights.get(&v.agent_id).copied().unwrap_or(0.0),
                })
                .collect();
            let votes_cast = new_votes.len();
            for vote in new_votes {
                if let Err(e) = record.append_vote(vote) {
                    warn!(session_id = %session_id, error = %e, "Dropped vote");
                }
            }

            if cancel.is_cancelled() || batch.any_cancelled() {
                record.finish(SessionStatus::Cancelled, Some("cancelled".into()));
            } else if votes_cast < MIN_PARTICIPANTS {
                record.finish(
                    SessionStatus::Failed,
                    Some(format!(
                        "iteration {iteration}: only {votes_cast} of {} participants voted",
                        available.len()
                    )),
                );
            } else {
                let score = consensus_score(&weighted, &self.config);
                let delta = score - previous_score;
                trail.push(StigmergyMarker {
                    iteration,
                    score,
                    delta,
                    direction: self.config.direction(delta),
                    votes_cast,
                });
                info!(
                    session_id = %session_id,
                    iteration,
                    score,
                    delta,
                    votes_cast,
                    "Swarm iteration scored"
                );
                iterations_used = iteration;
                previous_score = score;
                if score > best_score {
                    best_score = score;
                }
                if score >= consensus_threshold {
                    converged = true;
                }
            }
            self.save(&record).await;
            if record.status.is_terminal() || converged {
                break;
            }
        }

        let mut outcomes = Vec::new();
        if record.status == SessionStatus::Running {
            let final_score = if converged { previous_score } else { best_score };
            let final_votes: Vec<&Vote> = record.votes_in_iteration(iterations_used).collect();
            let voters: Vec<String> = final_votes.iter().map(|v| v.agent_id.clone()).collect();
            let synthesizer = strongest(&self.router, &voters)
                .or_else(|| strongest(&self.router, &record.participant_agent_ids))
                .unwrap_or_default();
            let mut consensus = ConsensusResult {
                consensus_text: String::new(),
                consensus_score: final_score,
                converged,
                iterations_used,
                stigmergy_trail: trail,
                participants: record.participant_agent_ids.clone(),
            };

            let prompt = synthesis_prompt(&record.topic, &final_votes, final_score, converged);
            let winning = plurality(&final_votes);
            let vote_outcomes: Vec<InteractionOutcome> = record
                .participant_agent_ids
                .iter()
                .map(|agent_id| {
                    match final_votes.iter().find(|v| &v.agent_id == agent_id) {
                        Some(v) if Some(v.vote) == winning => {
                            InteractionOutcome::now(agent_id, WITH_PLURALITY)
                        }
                        Some(_) => InteractionOutcome::now(agent_id, AGAINST_PLURALITY),
                        None => InteractionOutcome::failure(agent_id),
                    }
                })
                .collect();

            let mut task = DispatchRequest::new(synthesizer.clone(), prompt)
                .with_session(session_id)
                .with_cancel(cancel.clone());
            if let Some(timeout) = synthesis_timeout {
                task = task.with_timeout(timeout);
            }
            match self.pool.dispatch(task).await {
                Ok(result) => {
                    consensus.consensus_text = result.output();
                    outcomes = vote_outcomes;
                    let status = if converged {
                        SessionStatus::Converged
                    } else {
                        SessionStatus::Synthesized
                    };
                    record.consensus = Some(consensus.clone());
                    record.finish(status, None);
                    sink(SessionEvent::Consensus {
                        session_id,
                        result: consensus,
                    });
                }
                Err(ConclaveError::Cancelled(_)) => {
                    record.consensus = Some(consensus);
                    record.finish(SessionStatus::Cancelled, Some("cancelled".into()));
                }
                Err(e) => {
                    outcomes.push(InteractionOutcome::failure(&synthesizer));
                    record.consensus = Some(consensus);
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
            SessionStatus::Converged | SessionStatus::Synthesized => info!(
                session_id = %session_id,
                converged,
                iterations_used,
                "Swarm finished"
            ),
            _ => {
                let message = record
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| format!("{:?}", record.status));
                if record.status == SessionStatus::Failed {
                    error!(session_id = %session_id, reason = %message, "Swarm failed");
                } else {
                    info!(session_id = %session_id, "Swarm cancelled");
                }
                sink(SessionEvent::Error {
                    session_id,
                    message,
                });
            }
        }

        SwarmResult {
            session_id,
            status: record.status,
            topic: record.topic,
            votes: record.votes,
            consensus: record.consensus,
            failure_reason: record.failure_reason,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn save(&self, record: &SessionRecord) {
        if let Err(e) = self.sessions.update(record).await {
            warn!(session_id = %record.id, error = %e, "Failed to persist session");
        }
    }
}
