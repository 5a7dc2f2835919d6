//! Streaming events emitted while a session runs.

use conclave_session::{ConsensusResult, Phase, VoteKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// One event on a session's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A roundtable participant finished its turn.
    Turn {
        session_id: Uuid,
        round: u32,
        phase: Phase,
        agent_id: String,
        content: String,
    },
    /// The roundtable synthesizer produced the final answer.
    Synthesis {
        session_id: Uuid,
        agent_id: String,
        content: String,
    },
    /// A swarm participant cast a vote.
    Vote {
        session_id: Uuid,
        iteration: u32,
        agent_id: String,
        vote: VoteKind,
        confidence: f64,
    },
    /// The swarm loop ended.
    Consensus {
        session_id: Uuid,
        result: ConsensusResult,
    },
    /// The session failed or was cancelled.
    Error { session_id: Uuid, message: String },
}

impl SessionEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            SessionEvent::Turn { session_id, .. }
            | SessionEvent::Synthesis { session_id, .. }
            | SessionEvent::Vote { session_id, .. }
            | SessionEvent::Consensus { session_id, .. }
            | SessionEvent::Error { session_id, .. } => *session_id,
        }
    }

    /// Whether no further events follow this one.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            SessionEvent::Synthesis { .. }
                | SessionEvent::Consensus { .. }
                | SessionEvent::Error { .. }
        )
    }
}

/// Callback receiving events as they happen. Must not block.
pub type EventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// A sink that discards every event.
pub fn discard() -> EventSink {
    Arc::new(|_| {})
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let id = Uuid::new_v4();
        let event = SessionEvent::Turn {
            session_id: id,
            round: 2,
            phase: Phase::Work,
            agent_id: "alpha".into(),
            content: "idea".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "turn");
        assert_eq!(json["round"], 2);
        assert_eq!(json["phase"], "WORK");
        assert!(!event.is_final());

        let vote = SessionEvent::Vote {
            session_id: id,
            iteration: 1,
            agent_id: "beta".into(),
            vote: VoteKind::Extend,
            confidence: 0.8,
        };
        let json = serde_json::to_value(&vote).unwrap();
        assert_eq!(json["type"], "vote");
        assert_eq!(json["vote"], "extend");
        assert_eq!(vote.session_id(), id);
    }
}
