//! Session records shared by the roundtable and swarm engines.
//!
//! A session owns an append-only sequence of [`Turn`]s (roundtable) or
//! [`Vote`]s (swarm). Records are written by the single engine that owns the
//! session and persisted through a [`SessionStore`].

pub mod model;
pub mod store;

pub use model::{
    ConsensusResult, Phase, SessionKind, SessionRecord, SessionStatus, StigmergyMarker,
    TrailDirection, Turn, Vote, VoteKind,
};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
