//! Runs fired jobs against the pool, router and session engines.

use crate::events::EventSink;
use crate::pool::{AgentPool, DispatchRequest, DispatchResult};
use crate::roundtable::{RoundtableEngine, RoundtableRequest, MAX_PARTICIPANTS, MAX_ROUNDS, MIN_PARTICIPANTS};
use crate::router::Router;
use crate::scheduler::{CronJob, JobDefinition, JobExecutor, JobPayload, AUTO_AGENT};
use crate::swarm::{SwarmEngine, SwarmRequest, MAX_ITERATIONS};
use crate::types::InteractionOutcome;
use async_trait::async_trait;
use conclave_core::{ConclaveError, ConclaveResult, Tool};
use conclave_session::SessionStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A named chain of prompts; each step receives the previous step's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub steps: Vec<String>,
}

/// Dispatch to the best-ranked agent for `message`, walking its fallback
/// chain until one answers. Every attempt feeds the router's reputation store.
pub async fn dispatch_routed(
    pool: &AgentPool,
    router: &Router,
    message: &str,
    tools: Option<Vec<Arc<dyn Tool>>>,
) -> ConclaveResult<DispatchResult> {
    let primary = router
        .route(message)
        .into_iter()
        .next()
        .ok_or_else(|| ConclaveError::Agent("no agent is available to route to".into()))?;
    let chain = router.fallback_chain(&primary.agent_id);
    debug!(primary = %primary.agent_id, chain = ?chain, "Routed message");

    let mut last_error = None;
    for agent_id in chain {
        let mut request = DispatchRequest::new(agent_id.clone(), message);
        if let Some(tools) = &tools {
            request = request.with_tools(tools.clone());
        }
        match pool.dispatch(request).await {
            Ok(result) => {
                router.update_scores(vec![InteractionOutcome::success(&agent_id)]);
                return Ok(result);
            }
            Err(ConclaveError::Cancelled(reason)) => {
                return Err(ConclaveError::Cancelled(reason));
            }
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Routed dispatch failed, trying fallback");
                router.update_scores(vec![InteractionOutcome::failure(&agent_id)]);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| ConclaveError::Agent("fallback chain was empty".into())))
}

/// [`JobExecutor`] that targets the pinned agent or the router, and runs
/// session payloads through the roundtable and swarm engines.
pub struct OrchestratorExecutor {
    pool: Arc<AgentPool>,
    router: Arc<Router>,
    roundtable: Arc<RoundtableEngine>,
    swarm: Arc<SwarmEngine>,
    pipelines: HashMap<String, PipelineConfig>,
    sink: EventSink,
}

impl OrchestratorExecutor {
    pub fn new(
        pool: Arc<AgentPool>,
        router: Arc<Router>,
        roundtable: Arc<RoundtableEngine>,
        swarm: Arc<SwarmEngine>,
        pipelines: Vec<PipelineConfig>,
        sink: EventSink,
    ) -> Self {
        Self {
            pool,
            router,
            roundtable,
            swarm,
            pipelines: pipelines.into_iter().map(|p| (p.name.clone(), p)).collect(),
            sink,
        }
    }

    async fn send(
        &self,
        job: &CronJob,
        message: &str,
        tools: Option<Vec<Arc<dyn Tool>>>,
    ) -> ConclaveResult<DispatchResult> {
        if !job.is_pinned() {
            return dispatch_routed(&self.pool, &self.router, message, tools).await;
        }
        let mut request = DispatchRequest::new(job.agent_id.clone(), message);
        if let Some(tools) = tools {
            request = request.with_tools(tools);
        }
        let result = self.pool.dispatch(request).await;
        let outcome = match &result {
            Ok(_) => Some(InteractionOutcome::success(&job.agent_id)),
            Err(ConclaveError::Cancelled(_)) => None,
            Err(_) => Some(InteractionOutcome::failure(&job.agent_id)),
        };
        if let Some(outcome) = outcome {
            self.router.update_scores(vec![outcome]);
        }
        result
    }

    async fn run_pipeline(&self, job: &CronJob, name: &str) -> ConclaveResult<String> {
        let pipeline = self
            .pipelines
            .get(name)
            .ok_or_else(|| ConclaveError::Config(format!("unknown pipeline '{name}'")))?;
        let mut previous = String::new();
        for (index, step) in pipeline.steps.iter().enumerate() {
            let message = if previous.is_empty() {
                step.clone()
            } else {
                format!("{step}\n\nInput from the previous step:\n{previous}")
            };
            let result = self.send(job, &message, None).await.map_err(|e| match e {
                ConclaveError::Timeout(_) | ConclaveError::Cancelled(_) => e,
                other => ConclaveError::Agent(format!(
                    "pipeline '{name}' step {} failed: {other}",
                    index + 1
                )),
            })?;
            previous = result.output();
        }
        Ok(previous)
    }

    async fn run_roundtable(&self, request: RoundtableRequest) -> ConclaveResult<String> {
        let plan = self.roundtable.prepare(&request).await?;
        let session_id = plan.session_id();
        let cancel = CancellationToken::new();
        // Cancels the spawned session if this attempt is dropped on timeout.
        let _cancel_on_drop = cancel.clone().drop_guard();
        let engine = self.roundtable.clone();
        let sink = self.sink.clone();
        let result = tokio::spawn(async move { engine.run(plan, sink, cancel).await })
            .await
            .map_err(|e| ConclaveError::Agent(format!("roundtable {session_id} aborted: {e}")))?;
        match (result.status, result.synthesis) {
            (SessionStatus::Synthesized, Some(text)) => Ok(text),
            (status, _) => Err(ConclaveError::Agent(format!(
                "roundtable {session_id} ended {status:?}: {}",
                result.failure_reason.unwrap_or_default()
            ))),
        }
    }

    async fn run_swarm(&self, request: SwarmRequest) -> ConclaveResult<String> {
        let plan = self.swarm.prepare(&request).await?;
        let session_id = plan.session_id();
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let engine = self.swarm.clone();
        let sink = self.sink.clone();
        let result = tokio::spawn(async move { engine.run(plan, sink, cancel).await })
            .await
            .map_err(|e| ConclaveError::Agent(format!("swarm {session_id} aborted: {e}")))?;
        match (result.status, result.consensus) {
            (SessionStatus::Converged | SessionStatus::Synthesized, Some(consensus)) => {
                Ok(consensus.consensus_text)
            }
            (status, _) => Err(ConclaveError::Agent(format!(
                "swarm {session_id} ended {status:?}: {}",
                result.failure_reason.unwrap_or_default()
            ))),
        }
    }

    fn check_agent(&self, job: &str, agent_id: &str) -> ConclaveResult<()> {
        if self.pool.registry().contains(agent_id) {
            Ok(())
        } else {
            Err(ConclaveError::Config(format!(
                "job '{job}' references unknown agent '{agent_id}'"
            )))
        }
    }

    fn check_participants(&self, job: &str, agents: &[String]) -> ConclaveResult<()> {
        if agents.len() < MIN_PARTICIPANTS || agents.len() > MAX_PARTICIPANTS {
            return Err(ConclaveError::Config(format!(
                "job '{job}': sessions need {MIN_PARTICIPANTS} to {MAX_PARTICIPANTS} participants"
            )));
        }
        agents.iter().try_for_each(|a| self.check_agent(job, a))
    }
}

#[async_trait]
impl JobExecutor for OrchestratorExecutor {
    async fn execute(&self, job: &CronJob) -> ConclaveResult<String> {
        info!(job = %job.name, kind = job.payload.kind(), agent = %job.agent_id, "Executing job");
        match &job.payload {
            JobPayload::Prompt { text } => Ok(self.send(job, text, None).await?.output()),
            JobPayload::Skill { tool, arguments } => {
                let handle = self
                    .pool
                    .tools()
                    .get(tool)
                    .cloned()
                    .ok_or_else(|| ConclaveError::Config(format!("unknown tool '{tool}'")))?;
                let message = format!(
                    "Invoke the `{tool}` tool with these arguments and report its result:\n{arguments}"
                );
                Ok(self.send(job, &message, Some(vec![handle])).await?.output())
            }
            JobPayload::Pipeline { name } => self.run_pipeline(job, name).await,
            JobPayload::Roundtable {
                topic,
                agents,
                rounds,
                synthesizer,
            } => {
                self.run_roundtable(RoundtableRequest {
                    topic: topic.clone(),
                    agents: agents.clone(),
                    rounds: *rounds,
                    synthesizer: synthesizer.clone(),
                    turn_timeout_secs: None,
                    synthesis_timeout_secs: None,
                })
                .await
            }
            JobPayload::Swarm {
                topic,
                agents,
                max_iterations,
                consensus_threshold,
            } => {
                self.run_swarm(SwarmRequest {
                    topic: topic.clone(),
                    agents: agents.clone(),
                    max_iterations: *max_iterations,
                    consensus_threshold: *consensus_threshold,
                    vote_timeout_secs: None,
                    synthesis_timeout_secs: None,
                })
                .await
            }
        }
    }

    fn validate(&self, definition: &JobDefinition) -> ConclaveResult<()> {
        let job = definition.name.as_str();
        if definition.agent != AUTO_AGENT {
            self.check_agent(job, &definition.agent)?;
        }
        match &definition.payload {
            JobPayload::Prompt { text } if text.trim().is_empty() => Err(ConclaveError::Config(
                format!("job '{job}': prompt text must not be empty"),
            )),
            JobPayload::Prompt { .. } => Ok(()),
            JobPayload::Skill { tool, .. } => {
                if self.pool.tools().get(tool).is_none() {
                    return Err(ConclaveError::Config(format!(
                        "job '{job}' references unknown tool '{tool}'"
                    )));
                }
                Ok(())
            }
            JobPayload::Pipeline { name } => match self.pipelines.get(name) {
                Some(p) if !p.steps.is_empty() => Ok(()),
                Some(_) => Err(ConclaveError::Config(format!(
                    "pipeline '{name}' has no steps"
                ))),
                None => Err(ConclaveError::Config(format!(
                    "job '{job}' references unknown pipeline '{name}'"
                ))),
            },
            JobPayload::Roundtable {
                agents,
                rounds,
                synthesizer,
                ..
            } => {
                if *rounds == 0 || *rounds > MAX_ROUNDS {
                    return Err(ConclaveError::Config(format!(
                        "job '{job}': rounds must be between 1 and {MAX_ROUNDS}"
                    )));
                }
                if let Some(synthesizer) = synthesizer {
                    self.check_agent(job, synthesizer)?;
                }
                self.check_participants(job, agents)
            }
            JobPayload::Swarm {
                agents,
                max_iterations,
                consensus_threshold,
                ..
            } => {
                if *max_iterations == 0 || *max_iterations > MAX_ITERATIONS {
                    return Err(ConclaveError::Config(format!(
                        "job '{job}': max_iterations must be between 1 and {MAX_ITERATIONS}"
                    )));
                }
                if !(*consensus_threshold > 0.0 && *consensus_threshold <= 1.0) {
                    return Err(ConclaveError::Config(format!(
                        "job '{job}': consensus_threshold must be in (0, 1]"
                    )));
                }
                self.check_participants(job, agents)
            }
        }
    }
}
