//! Multi-agent orchestration for Conclave.
//!
//! An [`AgentPool`] owns the live agents and enforces the global concurrency
//! ceiling. The [`Router`] ranks agents for a message by specialty, load and
//! pheromone reputation, and learns from interaction outcomes. On top of
//! those sit the [`Scheduler`] for cron jobs and two multi-agent session
//! engines: the phased [`RoundtableEngine`] and the voting [`SwarmEngine`].
//! [`Orchestrator`] wires everything together.

/// Agent specs, runtime state and metrics.
pub mod types;
/// Durable agent registry with per-agent writes.
pub mod registry;
/// Per-agent dispatch counters.
pub mod monitor;
/// Live workers, dispatch and bounded parallel fan-out.
pub mod pool;
/// Pheromone evaporation and reinforcement.
pub mod pheromone;
/// Agent ranking, fallback chains and asynchronous score updates.
pub mod router;
/// Cron and interval jobs with history and retries.
pub mod scheduler;
/// Extracts structured votes from free-form replies.
pub mod vote_parser;
/// Phased multi-round discussions with a final synthesis.
pub mod roundtable;
/// Iterative voting toward a weighted consensus.
pub mod swarm;
/// Session progress events for streaming.
pub mod events;
/// Job execution and routed dispatch with fallback.
pub mod executor;
/// Built-in tools.
pub mod tools;
/// The assembled orchestration context.
pub mod context;
/// Scripted backend and fixtures for tests.
pub mod testing;

pub use context::{Orchestrator, OrchestratorConfig, Stores};
pub use events::{EventSink, SessionEvent};
pub use executor::{dispatch_routed, OrchestratorExecutor, PipelineConfig};
pub use monitor::AgentMonitor;
pub use pheromone::PheromoneConfig;
pub use pool::{AgentPool, BatchResult, DispatchRequest, DispatchResult, PoolConfig, TaskOutcome};
pub use registry::{AgentRegistry, AgentStore, FileAgentStore, MemoryAgentStore};
pub use roundtable::{RoundtableEngine, RoundtableRequest, RoundtableResult};
pub use router::{RankedAgent, Router, RouterConfig, RouterWeights};
pub use scheduler::{
    CronJob, FileJobStore, JobDefinition, JobExecutor, JobHistory, JobPayload, JobRun, JobStore,
    MemoryJobStore, ReconcileReport, RunStatus, RunTrigger, Schedule, Scheduler,
};
pub use swarm::{ConsensusConfig, SwarmEngine, SwarmRequest, SwarmResult};
pub use tools::{register_builtins, AgentRosterTool, ClockTool};
pub use types::{
    AgentMetrics, AgentSpec, AgentState, AgentStatus, AgentSummary, InteractionOutcome,
};
pub use vote_parser::VoteParser;
