use chrono::{DateTime, Utc};
use conclave_core::{ConclaveError, ConclaveResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Which engine owns a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Roundtable,
    Swarm,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::Roundtable => write!(f, "roundtable"),
            SessionKind::Swarm => write!(f, "swarm"),
        }
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    /// Swarm crossed its consensus threshold.
    Converged,
    /// A final answer was produced (roundtable done, or swarm exhausted its iterations).
    Synthesized,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Whether the session has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// Discussion phase of a roundtable round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Explore,
    Work,
    Validate,
}

impl Phase {
    /// Phase of the 1-based `round` out of `total` rounds.
    ///
    /// The first round always explores; the last of two or more validates.
    pub fn for_round(round: u32, total: u32) -> Self {
        if round <= 1 {
            Phase::Explore
        } else if round >= total {
            Phase::Validate
        } else {
            Phase::Work
        }
    }

    /// Instruction injected into the round prompt.
    pub fn instruction(&self) -> &'static str {
        match self {
            Phase::Explore => {
                "EXPLORE: map the problem. Offer your independent perspective, assumptions, and open questions."
            }
            Phase::Work => {
                "WORK: build on the discussion so far. Refine, challenge, or combine the strongest ideas."
            }
            Phase::Validate => {
                "VALIDATE: stress-test the emerging answer. Point out errors, gaps, and what must be kept."
            }
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Explore => write!(f, "EXPLORE"),
            Phase::Work => write!(f, "WORK"),
            Phase::Validate => write!(f, "VALIDATE"),
        }
    }
}

/// One agent's contribution to one roundtable round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub round_index: u32,
    pub phase: Phase,
    pub agent_id: String,
    pub content: String,
    pub duration_ms: u64,
}

/// A swarm participant's stance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteKind {
    Agree,
    Disagree,
    /// Agrees and adds to the proposal.
    Extend,
    /// Proposes a different direction.
    Pivot,
}

impl VoteKind {
    /// Parse a vote keyword, case-insensitively.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "agree" => Some(VoteKind::Agree),
            "disagree" => Some(VoteKind::Disagree),
            "extend" => Some(VoteKind::Extend),
            "pivot" => Some(VoteKind::Pivot),
            _ => None,
        }
    }
}

impl std::fmt::Display for VoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteKind::Agree => write!(f, "agree"),
            VoteKind::Disagree => write!(f, "disagree"),
            VoteKind::Extend => write!(f, "extend"),
            VoteKind::Pivot => write!(f, "pivot"),
        }
    }
}

/// One agent's vote in one swarm iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub iteration: u32,
    pub agent_id: String,
    pub vote: VoteKind,
    pub confidence: f64,
    pub reasoning: String,
    pub duration_ms: u64,
}

/// Direction of consensus movement between iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailDirection {
    Improving,
    Flat,
    Regressing,
}

/// One stigmergy marker: how the consensus score moved in one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StigmergyMarker {
    pub iteration: u32,
    pub score: f64,
    pub delta: f64,
    pub direction: TrailDirection,
    pub votes_cast: usize,
}

/// Terminal outcome of a swarm session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub consensus_text: String,
    pub consensus_score: f64,
    pub converged: bool,
    pub iterations_used: u32,
    pub stigmergy_trail: Vec<StigmergyMarker>,
    pub participants: Vec<String>,
}

/// A persisted roundtable or swarm session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub topic: String,
    pub participant_agent_ids: Vec<String>,
    pub session_type: SessionKind,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub votes: Vec<Vote>,
    /// Roundtable synthesis text, once produced.
    #[serde(default)]
    pub synthesis: Option<String>,
    /// Swarm outcome, once the loop has ended.
    #[serde(default)]
    pub consensus: Option<ConsensusResult>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SessionRecord {
    /// Start a new running session.
    pub fn new(kind: SessionKind, topic: impl Into<String>, participants: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            participant_agent_ids: participants,
            session_type: kind,
            status: SessionStatus::Running,
            created_at: Utc::now(),
            ended_at: None,
            turns: Vec::new(),
            votes: Vec::new(),
            synthesis: None,
            consensus: None,
            failure_reason: None,
            metadata: HashMap::new(),
        }
    }

    fn ensure_running(&self) -> ConclaveResult<()> {
        if self.status == SessionStatus::Running {
            Ok(())
        } else {
            Err(ConclaveError::Store(format!(
                "session {} is {:?}; records are append-only while running",
                self.id, self.status
            )))
        }
    }

    /// Append a turn. Only allowed while the session is running.
    pub fn append_turn(&mut self, turn: Turn) -> ConclaveResult<()> {
        self.ensure_running()?;
        self.turns.push(turn);
        Ok(())
    }

    /// Append a vote. Only allowed while the session is running.
    pub fn append_vote(&mut self, vote: Vote) -> ConclaveResult<()> {
        self.ensure_running()?;
        self.votes.push(vote);
        Ok(())
    }

    /// Move to a terminal status. A session finishes once; later calls are ignored.
    pub fn finish(&mut self, status: SessionStatus, reason: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.failure_reason = reason;
        self.ended_at = Some(Utc::now());
    }

    /// Turns recorded for one round.
    pub fn turns_in_round(&self, round: u32) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(move |t| t.round_index == round)
    }

    /// Votes recorded for one iteration.
    pub fn votes_in_iteration(&self, iteration: u32) -> impl Iterator<Item = &Vote> {
        self.votes.iter().filter(move |v| v.iteration == iteration)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn turn(round: u32, agent: &str) -> Turn {
        Turn {
            round_index: round,
            phase: Phase::Explore,
            agent_id: agent.into(),
            content: "idea".into(),
            duration_ms: 5,
        }
    }

    #[test]
    fn test_phase_assignment() {
        assert_eq!(Phase::for_round(1, 1), Phase::Explore);
        assert_eq!(Phase::for_round(1, 2), Phase::Explore);
        assert_eq!(Phase::for_round(2, 2), Phase::Validate);
        assert_eq!(Phase::for_round(2, 4), Phase::Work);
        assert_eq!(Phase::for_round(3, 4), Phase::Work);
        assert_eq!(Phase::for_round(4, 4), Phase::Validate);
    }

    #[test]
    fn test_phase_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Phase::Validate).unwrap(), "\"VALIDATE\"");
    }

    #[test]
    fn test_vote_kind_parse() {
        assert_eq!(VoteKind::parse(" AGREE "), Some(VoteKind::Agree));
        assert_eq!(VoteKind::parse("Pivot"), Some(VoteKind::Pivot));
        assert_eq!(VoteKind::parse("maybe"), None);
    }

    #[test]
    fn test_append_only_while_running() {
        let mut session = SessionRecord::new(
            SessionKind::Roundtable,
            "caching strategy",
            vec!["a".into(), "b".into()],
        );
        session.append_turn(turn(1, "a")).unwrap();
        session.append_turn(turn(1, "b")).unwrap();
        assert_eq!(session.turns_in_round(1).count(), 2);

        session.finish(SessionStatus::Synthesized, None);
        assert!(session.ended_at.is_some());
        assert!(session.append_turn(turn(2, "a")).is_err());
        assert_eq!(session.turns.len(), 2);
    }

    #[test]
    fn test_finish_is_sticky() {
        let mut session = SessionRecord::new(SessionKind::Swarm, "t", vec![]);
        session.finish(SessionStatus::Cancelled, Some("operator".into()));
        session.finish(SessionStatus::Failed, Some("late".into()));
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert_eq!(session.failure_reason.as_deref(), Some("operator"));
    }
}
